//! Test reports
//!
//! Every run produces a [`TestReport`]: the outcome, one record per
//! attempt, teardown diagnostics that did not change the outcome, and the
//! steps that were resolved along the way. Reports serialize to JSON.

use crate::dimension::Dimension;
use crate::mutation::MutationRecord;
use crate::result::{root_cause_of, Phase, StagehandError, StagehandResult};
use crate::step::StepRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Where and why a test failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Phase the failure was observed in
    pub phase: Phase,
    /// Top-level message
    pub message: String,
    /// Innermost cause
    pub root_cause: String,
}

impl FailureRecord {
    /// Record with an explicit message and cause
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            phase,
            root_cause: message.clone(),
            message,
        }
    }

    /// Record built from an error and its source chain
    #[must_use]
    pub fn from_error(phase: Phase, error: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            phase,
            message: error.to_string(),
            root_cause: root_cause_of(error),
        }
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.phase, self.message)?;
        if self.root_cause != self.message {
            write!(f, " (root cause: {})", self.root_cause)?;
        }
        Ok(())
    }
}

/// Final outcome of a test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    /// Body completed successfully
    Passed,
    /// Test failed
    Failed {
        /// Failure details
        failure: FailureRecord,
    },
    /// Test did not run because a read-only requirement was unmet
    Skipped {
        /// Why
        reason: String,
    },
}

impl TestOutcome {
    /// Whether the test passed
    #[must_use]
    pub const fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Whether the test failed
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Whether the test was skipped
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// Failure details, if failed
    #[must_use]
    pub const fn failure(&self) -> Option<&FailureRecord> {
        match self {
            Self::Failed { failure } => Some(failure),
            _ => None,
        }
    }
}

/// How one attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    /// Body passed
    Passed,
    /// Failed before or during the body
    Failed,
    /// Restart requested
    Restarted,
    /// Skipped during resolution
    Skipped,
}

/// One resolve/apply/body/teardown cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub number: u32,
    /// Session the attempt used, if one was created
    pub session: Option<Uuid>,
    /// How it ended
    pub result: AttemptResult,
    /// Reason given for a restart
    pub restart_reason: Option<String>,
    /// Mutations applied in this attempt, in apply order
    pub mutations: Vec<MutationRecord>,
    /// Wall time of the attempt
    pub duration_ms: u64,
}

/// A problem that was reported but did not decide the outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Phase it occurred in
    pub phase: Phase,
    /// Attempt it occurred in
    pub attempt: u32,
    /// Dimension involved, when the problem concerns one
    pub dimension: Option<Dimension>,
    /// Message
    pub message: String,
    /// Innermost cause
    pub root_cause: String,
}

impl Diagnostic {
    /// Diagnostics for `error`. A teardown aggregate yields one entry per
    /// failed undo so each dimension keeps its own cause.
    #[must_use]
    pub fn from_error(phase: Phase, attempt: u32, error: &StagehandError) -> Vec<Self> {
        match error {
            StagehandError::Teardown { failures } => failures
                .iter()
                .map(|failure| Self {
                    phase,
                    attempt,
                    dimension: Some(failure.dimension.clone()),
                    message: failure.to_string(),
                    root_cause: root_cause_of(failure),
                })
                .collect(),
            other => vec![Self {
                phase,
                attempt,
                dimension: None,
                message: other.to_string(),
                root_cause: root_cause_of(other),
            }],
        }
    }
}

/// Full record of one test run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    /// Test name
    pub test: String,
    /// Final outcome
    pub outcome: TestOutcome,
    /// Attempts in order
    pub attempts: Vec<AttemptRecord>,
    /// Non-fatal problems, mostly teardown failures
    pub diagnostics: Vec<Diagnostic>,
    /// Steps resolved during the run
    pub steps: Vec<StepRecord>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Total wall time
    pub duration_ms: u64,
}

impl TestReport {
    /// Number of restarts performed
    #[must_use]
    pub fn restarts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.result == AttemptResult::Restarted)
            .count()
    }

    /// One-line summary
    #[must_use]
    pub fn summary(&self) -> String {
        let status = match &self.outcome {
            TestOutcome::Passed => "PASSED".to_string(),
            TestOutcome::Failed { failure } => format!("FAILED {failure}"),
            TestOutcome::Skipped { reason } => format!("SKIPPED ({reason})"),
        };
        let mut line = format!(
            "{}: {status} after {} attempt(s) in {}ms",
            self.test,
            self.attempts.len(),
            self.duration_ms
        );
        if !self.diagnostics.is_empty() {
            line.push_str(&format!(", {} diagnostic(s)", self.diagnostics.len()));
        }
        line
    }

    /// Pretty JSON
    pub fn to_json(&self) -> StagehandResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::result::UndoFailure;

    fn report(outcome: TestOutcome) -> TestReport {
        TestReport {
            test: "wifi_toggle".into(),
            outcome,
            attempts: vec![AttemptRecord {
                number: 1,
                session: None,
                result: AttemptResult::Passed,
                restart_reason: None,
                mutations: Vec::new(),
                duration_ms: 5,
            }],
            diagnostics: Vec::new(),
            steps: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 7,
        }
    }

    #[test]
    fn test_failure_record_root_cause() {
        let err = StagehandError::SetupFailed {
            dimension: Dimension::Wifi,
            source: Box::new(StagehandError::invalid_state("radio missing")),
        };
        let record = FailureRecord::from_error(Phase::Apply, &err);
        assert_eq!(record.phase, Phase::Apply);
        assert!(record.root_cause.contains("radio missing"));
        assert!(record.to_string().starts_with("[apply]"));
    }

    #[test]
    fn test_teardown_diagnostics_per_undo() {
        let err = StagehandError::Teardown {
            failures: vec![
                UndoFailure {
                    dimension: Dimension::Wifi,
                    seq: 2,
                    cause: Box::new(StagehandError::Command {
                        command: "svc wifi disable".into(),
                        status: 1,
                        output: "radio busy".into(),
                    }),
                },
                UndoFailure {
                    dimension: Dimension::user("secondary"),
                    seq: 1,
                    cause: Box::new(StagehandError::invalid_state("user locked")),
                },
            ],
        };
        let diagnostics = Diagnostic::from_error(Phase::Teardown, 3, &err);
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].dimension, Some(Dimension::Wifi));
        assert!(diagnostics[0].message.contains("seq 2"));
        assert!(diagnostics[0].root_cause.contains("radio busy"));
        assert_eq!(diagnostics[1].attempt, 3);
        assert!(diagnostics[1].root_cause.contains("user locked"));
    }

    #[test]
    fn test_plain_error_is_one_diagnostic() {
        let err = StagehandError::invalid_state("lost");
        let diagnostics = Diagnostic::from_error(Phase::Teardown, 1, &err);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].dimension, None);
        assert!(diagnostics[0].root_cause.contains("lost"));
    }

    #[test]
    fn test_summary_lines() {
        assert_eq!(
            report(TestOutcome::Passed).summary(),
            "wifi_toggle: PASSED after 1 attempt(s) in 7ms"
        );
        let skipped = report(TestOutcome::Skipped {
            reason: "no nfc".into(),
        });
        assert!(skipped.summary().contains("SKIPPED (no nfc)"));
    }

    #[test]
    fn test_json_outcome_tag() {
        let failed = report(TestOutcome::Failed {
            failure: FailureRecord::new(Phase::Body, "assertion failed"),
        });
        let json = failed.to_json().unwrap();
        assert!(json.contains("\"status\": \"failed\""));
        let back: TestReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.outcome, failed.outcome);
    }
}
