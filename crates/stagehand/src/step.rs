//! Interactive steps
//!
//! A step is a unit of test work that either an automation or a human
//! tester resolves. Its state machine is:
//!
//! ```text
//! Pending ──► Automated ─────┬──► Resolved(pass | fail)
//!    │                       └──► Aborted
//!    └──────► AwaitingHuman ─┬──► Resolved(pass | fail)
//!                            └──► Aborted
//! ```
//!
//! `Resolved` and `Aborted` are terminal; no transition leaves them.

use crate::result::{StagehandError, StagehandResult};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// IDENTITY AND STATE
// =============================================================================

/// Stable identity of a step, used to bind automations
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Create a step id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StepId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Pass or fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The step passed
    Pass,
    /// The step failed
    Fail,
}

/// Where a step is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepState {
    /// Created, not yet started
    Pending,
    /// An automation is resolving the step
    Automated,
    /// Waiting for a human to choose an affordance
    AwaitingHuman,
    /// Finished with a verdict
    Resolved {
        /// Outcome
        verdict: Verdict,
    },
    /// Cancelled before a verdict was reached
    Aborted,
}

impl StepState {
    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved { .. } | Self::Aborted)
    }

    /// Whether moving to `next` is legal
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Automated | Self::AwaitingHuman)
                | (
                    Self::Automated | Self::AwaitingHuman,
                    Self::Resolved { .. } | Self::Aborted
                )
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Automated => f.write_str("automated"),
            Self::AwaitingHuman => f.write_str("awaiting_human"),
            Self::Resolved {
                verdict: Verdict::Pass,
            } => f.write_str("resolved(pass)"),
            Self::Resolved {
                verdict: Verdict::Fail,
            } => f.write_str("resolved(fail)"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

// =============================================================================
// AFFORDANCES AND RESOLUTIONS
// =============================================================================

/// A choice offered to a human tester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affordance {
    /// Identifier the presentation surface reports back
    pub id: String,
    /// Label shown to the tester
    pub label: String,
    /// Verdict the choice maps to
    pub verdict: Verdict,
}

impl Affordance {
    /// Affordance that passes the step
    pub fn pass(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            verdict: Verdict::Pass,
        }
    }

    /// Affordance that fails the step
    pub fn fail(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            verdict: Verdict::Fail,
        }
    }

    /// The default pair: Continue (pass) and Fail (fail)
    #[must_use]
    pub fn standard() -> Vec<Self> {
        vec![Self::pass("continue", "Continue"), Self::fail("fail", "Fail")]
    }
}

/// Why a step failed
#[derive(Debug)]
pub struct StepFailure {
    /// Human-readable reason
    pub reason: String,
    /// Error raised by an automation, if any
    pub cause: Option<StagehandError>,
}

impl StepFailure {
    /// Failure with a reason only
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            cause: None,
        }
    }

    /// Failure carrying the error that caused it
    #[must_use]
    pub fn from_error(cause: StagehandError) -> Self {
        Self {
            reason: cause.to_string(),
            cause: Some(cause),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Outcome of a resolved step
#[derive(Debug)]
pub enum StepResolution<E> {
    /// Passed with a typed result
    Pass(E),
    /// Failed
    Fail(StepFailure),
}

impl<E> StepResolution<E> {
    /// Verdict of this resolution
    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        match self {
            Self::Pass(_) => Verdict::Pass,
            Self::Fail(_) => Verdict::Fail,
        }
    }

    /// Whether the step passed
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass(_))
    }

    /// Convert into a `Result`
    pub fn into_result(self) -> Result<E, StepFailure> {
        match self {
            Self::Pass(value) => Ok(value),
            Self::Fail(failure) => Err(failure),
        }
    }
}

/// Response reported by a presentation surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanResponse {
    /// Chosen affordance id
    pub affordance: String,
    /// Optional free-form input
    pub input: Option<String>,
}

// =============================================================================
// STEP SPEC
// =============================================================================

type Interpreter<E> = Box<dyn Fn(&Affordance, &HumanResponse) -> StepResolution<E> + Send + Sync>;

/// Declaration of a step: instruction, affordances and how to read a human answer
pub struct StepSpec<E> {
    id: StepId,
    instruction: String,
    affordances: Vec<Affordance>,
    interpret: Interpreter<E>,
}

impl<E> fmt::Debug for StepSpec<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSpec")
            .field("id", &self.id)
            .field("instruction", &self.instruction)
            .field("affordances", &self.affordances)
            .finish_non_exhaustive()
    }
}

impl StepSpec<()> {
    /// A yes/no step with the standard affordances
    pub fn confirm(id: impl Into<StepId>, instruction: impl Into<String>) -> Self {
        Self::new(id, instruction, |affordance, response| {
            match affordance.verdict {
                Verdict::Pass => StepResolution::Pass(()),
                Verdict::Fail => StepResolution::Fail(StepFailure::new(
                    response
                        .input
                        .clone()
                        .unwrap_or_else(|| format!("tester chose '{}'", affordance.label)),
                )),
            }
        })
    }
}

impl<E> StepSpec<E> {
    /// A step whose human answer is interpreted by `interpret`
    pub fn new<F>(id: impl Into<StepId>, instruction: impl Into<String>, interpret: F) -> Self
    where
        F: Fn(&Affordance, &HumanResponse) -> StepResolution<E> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            instruction: instruction.into(),
            affordances: Affordance::standard(),
            interpret: Box::new(interpret),
        }
    }

    /// Replace the offered affordances
    #[must_use]
    pub fn with_affordances(mut self, affordances: Vec<Affordance>) -> Self {
        self.affordances = affordances;
        self
    }

    /// Step identity
    #[must_use]
    pub const fn id(&self) -> &StepId {
        &self.id
    }

    /// Instruction shown to the tester
    #[must_use]
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Offered affordances
    #[must_use]
    pub fn affordances(&self) -> &[Affordance] {
        &self.affordances
    }

    /// Interpret a human response. Unknown affordance ids are rejected.
    pub fn interpret(&self, response: &HumanResponse) -> StagehandResult<StepResolution<E>> {
        let affordance = self
            .affordances
            .iter()
            .find(|a| a.id == response.affordance)
            .ok_or_else(|| {
                StagehandError::invalid_state(format!(
                    "step '{}' offers no affordance '{}'",
                    self.id, response.affordance
                ))
            })?;
        Ok((self.interpret)(affordance, response))
    }
}

// =============================================================================
// STEP
// =============================================================================

/// Who resolved a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    /// A bound automation
    Automation,
    /// A human tester
    Human,
}

/// A running step with its typed result slot
#[derive(Debug)]
pub struct Step<E> {
    id: StepId,
    instruction: String,
    state: StepState,
    result: Option<StepResolution<E>>,
}

impl<E> Step<E> {
    /// Create a pending step
    pub fn new(id: StepId, instruction: impl Into<String>) -> Self {
        Self {
            id,
            instruction: instruction.into(),
            state: StepState::Pending,
            result: None,
        }
    }

    /// Step identity
    #[must_use]
    pub const fn id(&self) -> &StepId {
        &self.id
    }

    /// Instruction
    #[must_use]
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> StepState {
        self.state
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: StepState) -> StagehandResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(StagehandError::invalid_state(format!(
                "step '{}' cannot move from {} to {next}",
                self.id, self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Record a resolution and move to `Resolved`
    pub fn resolve(&mut self, resolution: StepResolution<E>) -> StagehandResult<()> {
        self.transition(StepState::Resolved {
            verdict: resolution.verdict(),
        })?;
        self.result = Some(resolution);
        Ok(())
    }

    /// Move to `Aborted`; no result is recorded
    pub fn abort(&mut self) -> StagehandResult<()> {
        self.transition(StepState::Aborted)
    }

    /// Take the recorded result
    pub fn take_result(&mut self) -> Option<StepResolution<E>> {
        self.result.take()
    }
}

/// Serializable record of a resolved step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step identity
    pub id: StepId,
    /// Instruction
    pub instruction: String,
    /// Who resolved it
    pub resolved_by: ResolvedBy,
    /// Verdict
    pub verdict: Verdict,
    /// Failure reason, for failed steps
    pub reason: Option<String>,
    /// Time from start to resolution
    pub duration_ms: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    mod state_tests {
        use super::*;

        const ALL: [StepState; 6] = [
            StepState::Pending,
            StepState::Automated,
            StepState::AwaitingHuman,
            StepState::Resolved {
                verdict: Verdict::Pass,
            },
            StepState::Resolved {
                verdict: Verdict::Fail,
            },
            StepState::Aborted,
        ];

        #[test]
        fn test_terminal_states_have_no_exits() {
            for from in ALL.iter().filter(|s| s.is_terminal()) {
                for to in ALL {
                    assert!(!from.can_transition_to(to), "{from} -> {to}");
                }
            }
        }

        #[test]
        fn test_pending_cannot_resolve_directly() {
            let mut step: Step<()> = Step::new(StepId::new("s"), "do it");
            assert!(step.resolve(StepResolution::Pass(())).is_err());
            assert!(step.abort().is_err());
            assert_eq!(step.state(), StepState::Pending);
        }

        #[test]
        fn test_human_path() {
            let mut step: Step<u8> = Step::new(StepId::new("s"), "count lights");
            step.transition(StepState::AwaitingHuman).unwrap();
            step.resolve(StepResolution::Pass(3)).unwrap();
            assert_eq!(
                step.state(),
                StepState::Resolved {
                    verdict: Verdict::Pass
                }
            );
            assert!(matches!(step.take_result(), Some(StepResolution::Pass(3))));
            assert!(step.transition(StepState::Aborted).is_err());
        }
    }

    mod spec_tests {
        use super::*;

        #[test]
        fn test_confirm_maps_affordances() {
            let spec = StepSpec::confirm("check-led", "Is the LED green?");
            let pass = spec
                .interpret(&HumanResponse {
                    affordance: "continue".into(),
                    input: None,
                })
                .unwrap();
            assert!(pass.is_pass());

            let fail = spec
                .interpret(&HumanResponse {
                    affordance: "fail".into(),
                    input: Some("LED is red".into()),
                })
                .unwrap();
            let failure = fail.into_result().unwrap_err();
            assert_eq!(failure.reason, "LED is red");
        }

        #[test]
        fn test_unknown_affordance_rejected() {
            let spec = StepSpec::confirm("x", "y");
            assert!(spec
                .interpret(&HumanResponse {
                    affordance: "maybe".into(),
                    input: None,
                })
                .is_err());
        }

        #[test]
        fn test_typed_interpretation() {
            let spec = StepSpec::new("pin", "Enter the PIN shown", |a, r| match a.verdict {
                Verdict::Pass => StepResolution::Pass(
                    r.input.as_deref().and_then(|s| s.parse::<u32>().ok()).unwrap_or(0),
                ),
                Verdict::Fail => StepResolution::Fail(StepFailure::new("no pin")),
            });
            let resolution = spec
                .interpret(&HumanResponse {
                    affordance: "continue".into(),
                    input: Some("1234".into()),
                })
                .unwrap();
            assert_eq!(resolution.into_result().unwrap(), 1234);
        }
    }
}
