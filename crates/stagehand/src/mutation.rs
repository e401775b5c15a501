//! Mutations: one reversible change to one dimension.
//!
//! A mutation captures the dimension's prior value when applied so that its
//! undo restores exactly what was there. Undo is safe to call when apply never
//! ran, when apply failed halfway, and more than once.

use crate::cancel::CancelToken;
use crate::device::DeviceServices;
use crate::dimension::{Dimension, StateValue};
use crate::driver::{run_commands, DimensionDriver};
use crate::poll::{Poll, PollOptions};
use crate::requirement::Strength;
use crate::result::{StagehandError, StagehandResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    /// Not yet applied
    Pending,
    /// Target was already in place; nothing was changed
    NoOp,
    /// Target was written and observed
    Applied,
    /// Apply started but did not complete
    Failed,
    /// Prior value was restored
    Undone,
}

/// Serializable summary of a mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Changed dimension
    pub dimension: Dimension,
    /// Value written
    pub target: StateValue,
    /// Value observed before apply
    pub prior: Option<StateValue>,
    /// Apply order within the session
    pub seq: Option<u64>,
    /// Lifecycle state
    pub state: MutationState,
}

/// One reversible change to one dimension
#[derive(Clone)]
pub struct Mutation {
    dimension: Dimension,
    target: StateValue,
    strength: Strength,
    driver: Option<Arc<dyn DimensionDriver>>,
    planned_noop: bool,
    prior: Option<StateValue>,
    seq: Option<u64>,
    state: MutationState,
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("dimension", &self.dimension)
            .field("target", &self.target)
            .field("strength", &self.strength)
            .field("planned_noop", &self.planned_noop)
            .field("prior", &self.prior)
            .field("seq", &self.seq)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Mutation {
    /// Create a pending mutation. `driver` is `None` for read-only dimensions.
    #[must_use]
    pub fn new(
        dimension: Dimension,
        target: StateValue,
        strength: Strength,
        driver: Option<Arc<dyn DimensionDriver>>,
    ) -> Self {
        Self {
            dimension,
            target,
            strength,
            driver,
            planned_noop: false,
            prior: None,
            seq: None,
            state: MutationState::Pending,
        }
    }

    /// Mark that the target was already in place when the plan was resolved
    #[must_use]
    pub const fn planned_as_noop(mut self, noop: bool) -> Self {
        self.planned_noop = noop;
        self
    }

    /// Dimension this mutation changes
    #[must_use]
    pub const fn dimension(&self) -> &Dimension {
        &self.dimension
    }

    /// Value this mutation writes
    #[must_use]
    pub const fn target(&self) -> &StateValue {
        &self.target
    }

    /// Strength of the requirement that produced this mutation
    #[must_use]
    pub const fn strength(&self) -> Strength {
        self.strength
    }

    /// Value observed before apply, once apply has observed it
    #[must_use]
    pub const fn prior(&self) -> Option<&StateValue> {
        self.prior.as_ref()
    }

    /// Apply sequence number
    #[must_use]
    pub const fn seq(&self) -> Option<u64> {
        self.seq
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> MutationState {
        self.state
    }

    /// Whether the resolver found the target already in place
    #[must_use]
    pub const fn is_planned_noop(&self) -> bool {
        self.planned_noop
    }

    /// Whether undo has something to restore
    #[must_use]
    pub const fn needs_undo(&self) -> bool {
        matches!(self.state, MutationState::Applied | MutationState::Failed)
    }

    /// Pending copy with the same dimension, target and driver
    #[must_use]
    pub fn fresh(&self) -> Self {
        Self {
            prior: None,
            seq: None,
            state: MutationState::Pending,
            ..self.clone()
        }
    }

    /// Summary for reports
    #[must_use]
    pub fn record(&self) -> MutationRecord {
        MutationRecord {
            dimension: self.dimension.clone(),
            target: self.target.clone(),
            prior: self.prior.clone(),
            seq: self.seq,
            state: self.state,
        }
    }

    /// Apply the mutation, capturing the prior value first.
    ///
    /// After writing, waits until the target is observable.
    pub fn apply(
        &mut self,
        services: &DeviceServices,
        seq: u64,
        poll: &PollOptions,
        cancel: &CancelToken,
    ) -> StagehandResult<()> {
        if self.state != MutationState::Pending {
            return Err(StagehandError::invalid_state(format!(
                "mutation of {} was already applied (state {:?})",
                self.dimension, self.state
            )));
        }
        cancel.check()?;
        self.seq = Some(seq);
        self.state = MutationState::Failed;

        let prior = services.observe(&self.dimension)?;
        self.prior = Some(prior.clone());
        if prior == self.target {
            debug!(dimension = %self.dimension, seq, "target already in place");
            self.state = MutationState::NoOp;
            return Ok(());
        }

        let Some(driver) = self.driver.clone() else {
            return Err(StagehandError::invalid_state(format!(
                "{} is read-only and holds {prior}",
                self.dimension
            )));
        };

        info!(dimension = %self.dimension, from = %prior, to = %self.target, seq, "applying mutation");
        let commands = driver.commands(&self.dimension, &prior, &self.target)?;
        run_commands(services, &commands)?;
        await_value(services, &self.dimension, &self.target, poll, Some(cancel))?;
        self.state = MutationState::Applied;
        Ok(())
    }

    /// Restore the prior value.
    ///
    /// Does nothing if apply never ran, found the target already in place, or
    /// failed before the prior value was observed. Undo ignores cancellation.
    pub fn undo(&mut self, services: &DeviceServices, poll: &PollOptions) -> StagehandResult<()> {
        if !self.needs_undo() {
            if self.state == MutationState::NoOp {
                self.state = MutationState::Undone;
            }
            return Ok(());
        }
        let (Some(prior), Some(driver)) = (self.prior.clone(), self.driver.clone()) else {
            self.state = MutationState::Undone;
            return Ok(());
        };

        let current = services.observe(&self.dimension)?;
        if current == prior {
            debug!(dimension = %self.dimension, "prior value already in place");
            self.state = MutationState::Undone;
            return Ok(());
        }

        info!(dimension = %self.dimension, from = %current, to = %prior, seq = ?self.seq, "undoing mutation");
        let commands = driver.commands(&self.dimension, &current, &prior)?;
        run_commands(services, &commands)?;
        await_value(services, &self.dimension, &prior, poll, None)?;
        self.state = MutationState::Undone;
        Ok(())
    }
}

fn await_value(
    services: &DeviceServices,
    dimension: &Dimension,
    expected: &StateValue,
    poll: &PollOptions,
    cancel: Option<&CancelToken>,
) -> StagehandResult<()> {
    let mut converge = Poll::for_value(format!("{dimension} to become {expected}"), || {
        services.observe(dimension)
    })
    .to_be_equal_to(expected.clone())
    .with_options(poll.clone());
    if let Some(token) = cancel {
        converge = converge.cancel_with(token);
    }
    converge.wait().map(|_| ())
}
