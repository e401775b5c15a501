//! Cooperative cancellation shared by the orchestrator, pollers and step waits.
//!
//! A [`CancelToken`] is cheap to clone; every clone observes the same state.
//! The first call to [`CancelToken::cancel`] wins and later reasons are ignored.

use crate::result::{StagehandError, StagehandResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Why a unit of work was cancelled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CancelReason {
    /// The per-test deadline elapsed
    Timeout,
    /// A restart of the current test was requested
    Restart(String),
    /// The run was aborted from outside
    Abort(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("test timed out"),
            Self::Restart(reason) => write!(f, "restart requested: {reason}"),
            Self::Abort(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    reason: Mutex<Option<CancelReason>>,
    signal: Condvar,
}

/// Shared cancellation flag with an interruptible sleep
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// Create a token that is not cancelled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with `reason`. Returns `false` if the token was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut slot = self
            .shared
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.shared.signal.notify_all();
        true
    }

    /// Whether the token has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// The reason the token was cancelled with
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.shared
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return `Err(Cancelled)` if the token has been cancelled
    pub fn check(&self) -> StagehandResult<()> {
        match self.reason() {
            Some(reason) => Err(StagehandError::Cancelled { reason }),
            None => Ok(()),
        }
    }

    /// Sleep for `duration`, waking early if the token is cancelled.
    ///
    /// Returns `Err(Cancelled)` when woken by cancellation.
    pub fn sleep(&self, duration: Duration) -> StagehandResult<()> {
        let deadline = Instant::now() + duration;
        let mut slot = self
            .shared
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(reason) = slot.as_ref() {
                return Err(StagehandError::Cancelled {
                    reason: reason.clone(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (guard, _) = self
                .shared
                .signal
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }
}
