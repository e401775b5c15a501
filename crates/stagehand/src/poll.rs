//! Polling
//!
//! Repeatedly probes a value until it satisfies a predicate, the deadline
//! passes, or the caller's [`CancelToken`] fires. A poll holds no state
//! between calls, so independent polls may run concurrently.
//!
//! ```ignore
//! let enabled = Poll::for_value("wifi enabled", || device.observe(&Dimension::Wifi))
//!     .to_be_equal_to(StateValue::Bool(true))
//!     .timeout(Duration::from_secs(5))
//!     .wait()?;
//! ```

use crate::cancel::CancelToken;
use crate::result::{StagehandError, StagehandResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Default poll timeout (30 seconds)
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 30_000;

/// Default interval between probes (50ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Consecutive probe errors tolerated before an error is propagated
pub const DEFAULT_TOLERATED_ERRORS: u32 = 3;

// =============================================================================
// OPTIONS
// =============================================================================

/// How probe errors are treated while polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Propagate a probe error once more than `tolerated` consecutive errors occurred
    ErrorOnFail {
        /// Consecutive errors swallowed before failing
        tolerated: u32,
    },
    /// Swallow probe errors until the deadline
    IgnoreErrorsUntilTimeout,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::ErrorOnFail {
            tolerated: DEFAULT_TOLERATED_ERRORS,
        }
    }
}

/// Timing and error handling for a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOptions {
    /// Maximum time to keep probing, in milliseconds
    pub timeout_ms: u64,
    /// Pause between probes, in milliseconds
    pub interval_ms: u64,
    /// Probe error handling
    pub error_policy: ErrorPolicy,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl PollOptions {
    /// Create default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set interval
    #[must_use]
    pub const fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Set the error policy
    #[must_use]
    pub const fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    /// Timeout as a duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Interval as a duration
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// =============================================================================
// POLL
// =============================================================================

/// Builder for a single poll over a probed value
pub struct Poll<'a, V> {
    what: String,
    probe: Box<dyn FnMut() -> StagehandResult<V> + 'a>,
    predicate: Box<dyn Fn(&V) -> bool + 'a>,
    options: PollOptions,
    cancel: Option<CancelToken>,
}

impl<V> fmt::Debug for Poll<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poll")
            .field("what", &self.what)
            .field("options", &self.options)
            .field("cancellable", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

impl<'a, V: fmt::Debug> Poll<'a, V> {
    /// Start a poll over `probe`. Without a predicate the first probed value is accepted.
    pub fn for_value<F>(what: impl Into<String>, probe: F) -> Self
    where
        F: FnMut() -> StagehandResult<V> + 'a,
    {
        Self {
            what: what.into(),
            probe: Box::new(probe),
            predicate: Box::new(|_| true),
            options: PollOptions::default(),
            cancel: None,
        }
    }

    /// Accept the first value matching `predicate`
    #[must_use]
    pub fn to_match<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&V) -> bool + 'a,
    {
        self.predicate = Box::new(predicate);
        self
    }

    /// Accept the first value equal to `target`
    #[must_use]
    pub fn to_be_equal_to(self, target: V) -> Self
    where
        V: PartialEq + 'a,
    {
        self.to_match(move |value| *value == target)
    }

    /// Replace all options
    #[must_use]
    pub fn with_options(mut self, options: PollOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the deadline
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the pause between probes
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.options.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Propagate probe errors after `tolerated` consecutive failures
    #[must_use]
    pub fn error_on_fail(mut self, tolerated: u32) -> Self {
        self.options.error_policy = ErrorPolicy::ErrorOnFail { tolerated };
        self
    }

    /// Swallow probe errors until the deadline
    #[must_use]
    pub fn ignore_errors_until_timeout(mut self) -> Self {
        self.options.error_policy = ErrorPolicy::IgnoreErrorsUntilTimeout;
        self
    }

    /// Abort the poll as soon as `token` is cancelled
    #[must_use]
    pub fn cancel_with(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    /// Run the poll to completion.
    ///
    /// The probe runs immediately; a value that already satisfies the
    /// predicate returns without sleeping. Never sleeps past the deadline.
    pub fn wait(mut self) -> StagehandResult<V> {
        let start = Instant::now();
        let timeout = self.options.timeout();
        let interval = self.options.interval();
        let mut last_observed: Option<String> = None;
        let mut consecutive_errors = 0u32;
        let mut probes = 0u32;

        loop {
            if let Some(token) = &self.cancel {
                token.check()?;
            }

            probes += 1;
            match (self.probe)() {
                Ok(value) => {
                    consecutive_errors = 0;
                    if (self.predicate)(&value) {
                        debug!(
                            what = %self.what,
                            probes,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "poll satisfied"
                        );
                        return Ok(value);
                    }
                    trace!(what = %self.what, observed = ?value, "poll not yet satisfied");
                    last_observed = Some(format!("{value:?}"));
                }
                Err(err) => {
                    if err.is_cancelled() {
                        return Err(err);
                    }
                    consecutive_errors += 1;
                    if let ErrorPolicy::ErrorOnFail { tolerated } = self.options.error_policy {
                        if consecutive_errors > tolerated {
                            debug!(what = %self.what, error = %err, "poll probe failed");
                            return Err(err);
                        }
                    }
                    trace!(what = %self.what, error = %err, "poll probe error swallowed");
                    last_observed = Some(format!("error: {err}"));
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(StagehandError::Timeout {
                    what: self.what.clone(),
                    elapsed_ms: elapsed.as_millis() as u64,
                    last_observed,
                });
            }

            let pause = interval.min(timeout - elapsed);
            match &self.cancel {
                Some(token) => token.sleep(pause)?,
                None => std::thread::sleep(pause),
            }
        }
    }
}

// =============================================================================
// CONVENIENCE FUNCTIONS
// =============================================================================

/// Poll `probe` until `predicate` holds, using `options`
pub fn poll_until<V, F, P>(
    what: &str,
    probe: F,
    predicate: P,
    options: &PollOptions,
    cancel: Option<&CancelToken>,
) -> StagehandResult<V>
where
    V: fmt::Debug,
    F: FnMut() -> StagehandResult<V>,
    P: Fn(&V) -> bool,
{
    let mut poll = Poll::for_value(what, probe)
        .to_match(predicate)
        .with_options(options.clone());
    if let Some(token) = cancel {
        poll = poll.cancel_with(token);
    }
    poll.wait()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use std::cell::Cell;
    use std::thread;

    mod satisfaction_tests {
        use super::*;

        #[test]
        fn test_already_satisfied_returns_without_sleeping() {
            let calls = Cell::new(0);
            let start = Instant::now();
            let value = Poll::for_value("answer", || {
                calls.set(calls.get() + 1);
                Ok(42)
            })
            .to_be_equal_to(42)
            .interval(Duration::from_secs(10))
            .wait()
            .unwrap();
            assert_eq!(value, 42);
            assert_eq!(calls.get(), 1);
            assert!(start.elapsed() < Duration::from_secs(1));
        }

        #[test]
        fn test_converges_after_several_probes() {
            let calls = Cell::new(0);
            let value = Poll::for_value("counter", || {
                calls.set(calls.get() + 1);
                Ok(calls.get())
            })
            .to_match(|v| *v >= 4)
            .interval(Duration::from_millis(1))
            .timeout(Duration::from_secs(5))
            .wait()
            .unwrap();
            assert_eq!(value, 4);
        }

        #[test]
        fn test_first_value_accepted_without_predicate() {
            let value = Poll::for_value("anything", || Ok("ready")).wait().unwrap();
            assert_eq!(value, "ready");
        }
    }

    mod timeout_tests {
        use super::*;

        #[test]
        fn test_times_out_no_earlier_than_deadline() {
            let start = Instant::now();
            let err = Poll::for_value("never", || Ok(false))
                .to_be_equal_to(true)
                .interval(Duration::from_millis(10))
                .timeout(Duration::from_millis(60))
                .wait()
                .unwrap_err();
            assert!(start.elapsed() >= Duration::from_millis(60));
            match err {
                StagehandError::Timeout {
                    what,
                    last_observed,
                    ..
                } => {
                    assert_eq!(what, "never");
                    assert_eq!(last_observed.as_deref(), Some("false"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn test_interval_longer_than_timeout_is_clamped() {
            let start = Instant::now();
            let result = Poll::for_value("never", || Ok(0))
                .to_be_equal_to(1)
                .interval(Duration::from_secs(30))
                .timeout(Duration::from_millis(40))
                .wait();
            assert!(result.is_err());
            assert!(start.elapsed() < Duration::from_secs(5));
        }
    }

    mod error_policy_tests {
        use super::*;

        fn flaky(failures: u32) -> impl FnMut() -> StagehandResult<u32> {
            let mut calls = 0;
            move || {
                calls += 1;
                if calls <= failures {
                    Err(StagehandError::invalid_state("transient"))
                } else {
                    Ok(calls)
                }
            }
        }

        #[test]
        fn test_tolerates_bounded_errors() {
            let value = Poll::for_value("flaky", flaky(2))
                .error_on_fail(2)
                .interval(Duration::from_millis(1))
                .wait()
                .unwrap();
            assert_eq!(value, 3);
        }

        #[test]
        fn test_propagates_after_tolerance() {
            let err = Poll::for_value("flaky", flaky(5))
                .error_on_fail(1)
                .interval(Duration::from_millis(1))
                .wait()
                .unwrap_err();
            assert!(matches!(err, StagehandError::InvalidState { .. }));
        }

        #[test]
        fn test_ignore_errors_reports_last_error_on_timeout() {
            let err = Poll::for_value("broken", || -> StagehandResult<u8> {
                Err(StagehandError::invalid_state("still broken"))
            })
            .ignore_errors_until_timeout()
            .interval(Duration::from_millis(5))
            .timeout(Duration::from_millis(30))
            .wait()
            .unwrap_err();
            match err {
                StagehandError::Timeout { last_observed, .. } => {
                    assert!(last_observed.unwrap().contains("still broken"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    mod cancellation_tests {
        use super::*;

        #[test]
        fn test_cancel_interrupts_long_interval() {
            let token = CancelToken::new();
            let canceller = token.clone();
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                canceller.cancel(CancelReason::Restart("retry".into()));
            });
            let start = Instant::now();
            let err = Poll::for_value("never", || Ok(0))
                .to_be_equal_to(1)
                .interval(Duration::from_secs(10))
                .timeout(Duration::from_secs(60))
                .cancel_with(&token)
                .wait()
                .unwrap_err();
            handle.join().unwrap();
            assert!(err.is_cancelled());
            assert!(start.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn test_poll_until_honours_options() {
            let options = PollOptions::new().with_timeout(1_000).with_interval(1);
            let mut n = 0;
            let value = poll_until(
                "n",
                || {
                    n += 1;
                    Ok(n)
                },
                |v| *v == 3,
                &options,
                None,
            )
            .unwrap();
            assert_eq!(value, 3);
        }
    }
}
