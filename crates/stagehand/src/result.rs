//! Result and error types for Stagehand.

use crate::cancel::CancelReason;
use crate::dimension::Dimension;
use crate::requirement::FailureMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for Stagehand operations
pub type StagehandResult<T> = Result<T, StagehandError>;

/// Phase of a test execution in which a failure was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Requirement discovery and resolution
    Resolve,
    /// Applying the resolved plan
    Apply,
    /// Running the test body
    Body,
    /// Undoing applied mutations
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolve => "resolve",
            Self::Apply => "apply",
            Self::Body => "body",
            Self::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// One undo that failed while tearing a session down
#[derive(Debug, Error)]
#[error("undo of {dimension} (seq {seq}) failed: {cause}")]
pub struct UndoFailure {
    /// Dimension whose prior value could not be restored
    pub dimension: Dimension,
    /// Apply sequence number of the mutation
    pub seq: u64,
    /// Underlying error
    #[source]
    pub cause: Box<StagehandError>,
}

/// Errors that can occur in Stagehand
#[derive(Debug, Error)]
pub enum StagehandError {
    /// Requirements on one dimension disagree and at least one is hard
    #[error("Conflicting requirements on {dimension}: {first} vs {second}")]
    Conflict {
        /// Contested dimension
        dimension: Dimension,
        /// First declared requirement
        first: String,
        /// Disagreeing requirement
        second: String,
    },

    /// A read-only dimension does not hold the required value
    #[error("Requirement on {dimension} cannot be satisfied: wanted {wanted}, device has {actual}")]
    Unsatisfied {
        /// Read-only dimension
        dimension: Dimension,
        /// Required value
        wanted: String,
        /// Observed value
        actual: String,
        /// Whether the test should fail or be skipped
        mode: FailureMode,
    },

    /// Applying a mutation failed; everything applied before it was torn down
    #[error("Setup failed while applying {dimension}: {source}")]
    SetupFailed {
        /// Dimension whose mutation failed
        dimension: Dimension,
        /// Root cause
        source: Box<StagehandError>,
    },

    /// One or more undos failed during teardown
    #[error(
        "Teardown failed: {} undo(s) did not complete ({})",
        .failures.len(),
        failed_dimensions(.failures)
    )]
    Teardown {
        /// Every failed undo, in teardown order
        failures: Vec<UndoFailure>,
    },

    /// A poll or wait exceeded its deadline
    #[error(
        "Timed out after {elapsed_ms}ms waiting for {what} (last observed: {})",
        .last_observed.as_deref().unwrap_or("nothing")
    )]
    Timeout {
        /// What was being waited for
        what: String,
        /// Time spent waiting
        elapsed_ms: u64,
        /// Last observed value, rendered for diagnostics
        last_observed: Option<String>,
    },

    /// The restart budget ran out
    #[error("Restart budget exhausted after {restarts} restart(s); last reason: {reason}")]
    TooManyRestarts {
        /// Restarts already performed
        restarts: u32,
        /// Reason given by the final restart request
        reason: String,
    },

    /// Work was cancelled cooperatively
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Why the work was cancelled
        reason: CancelReason,
    },

    /// A device command exited with a non-zero status
    #[error("Command `{command}` exited with status {status}: {output}")]
    Command {
        /// Rendered command line
        command: String,
        /// Exit status
        status: i32,
        /// Captured output
        output: String,
    },

    /// A device command succeeded but printed something unexpected
    #[error("Command `{command}` output did not match `{pattern}`: {output}")]
    UnexpectedOutput {
        /// Rendered command line
        command: String,
        /// Expected pattern
        pattern: String,
        /// Captured output
        output: String,
    },

    /// The device state of a dimension could not be read
    #[error("Could not observe {dimension}: {message}")]
    Observe {
        /// Dimension being read
        dimension: Dimension,
        /// Error message
        message: String,
    },

    /// A second automation was bound to the same step
    #[error("An automation is already bound to step '{step}'")]
    AutomationAlreadyBound {
        /// Step identity
        step: String,
    },

    /// An operation was attempted in the wrong state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl StagehandError {
    /// Create an invalid-state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an observation error
    pub fn observe(dimension: &Dimension, message: impl Into<String>) -> Self {
        Self::Observe {
            dimension: dimension.clone(),
            message: message.into(),
        }
    }

    /// Cancellation reason, if this error (or the error it wraps) is a cancellation
    #[must_use]
    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        match self {
            Self::Cancelled { reason } => Some(reason),
            Self::SetupFailed { source, .. } => source.cancel_reason(),
            _ => None,
        }
    }

    /// Whether this error is a cooperative cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason().is_some()
    }

    /// Message of the innermost error in the source chain
    #[must_use]
    pub fn root_cause(&self) -> String {
        root_cause_of(self)
    }
}

fn failed_dimensions(failures: &[UndoFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.dimension.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Walk an error's source chain and render the innermost error
pub(crate) fn root_cause_of(error: &(dyn std::error::Error + 'static)) -> String {
    let mut current = error;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}
