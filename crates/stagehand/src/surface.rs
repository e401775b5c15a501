//! Presentation surfaces
//!
//! A surface shows a step's instruction and affordances to a human tester
//! and reports the choice through a [`Responder`]. Surfaces may answer from
//! any thread, including synchronously inside [`PresentationSurface::present`].

use crate::result::{StagehandError, StagehandResult};
use crate::step::{Affordance, HumanResponse, StepId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// What a surface is asked to show
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPrompt {
    /// Step identity
    pub id: StepId,
    /// Instruction for the tester
    pub instruction: String,
    /// Choices offered
    pub affordances: Vec<Affordance>,
}

/// Shows steps to a human tester
pub trait PresentationSurface: Send + Sync {
    /// Show `prompt`; answer later (or immediately) through `responder`
    fn present(&self, prompt: &StepPrompt, responder: Responder);

    /// Stop showing `step`, which was resolved or aborted
    fn withdraw(&self, _step: &StepId) {}
}

#[derive(Debug, Default)]
pub(crate) struct ResponseSlot {
    response: Mutex<Option<HumanResponse>>,
    signal: Condvar,
}

impl ResponseSlot {
    /// Wait up to `timeout` for a response
    pub(crate) fn wait(&self, timeout: Duration) -> Option<HumanResponse> {
        let guard = self
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |response| response.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }
}

/// One-shot handle a surface uses to answer a step
#[derive(Debug, Clone)]
pub struct Responder {
    step: StepId,
    affordances: Vec<Affordance>,
    slot: Arc<ResponseSlot>,
}

impl Responder {
    pub(crate) fn new(step: StepId, affordances: Vec<Affordance>, slot: Arc<ResponseSlot>) -> Self {
        Self {
            step,
            affordances,
            slot,
        }
    }

    /// Step this responder answers
    #[must_use]
    pub const fn step(&self) -> &StepId {
        &self.step
    }

    /// Report the tester's choice.
    ///
    /// Fails if the affordance was not offered or the step was already answered.
    pub fn respond(&self, affordance: &str, input: Option<String>) -> StagehandResult<()> {
        if !self.affordances.iter().any(|a| a.id == affordance) {
            return Err(StagehandError::invalid_state(format!(
                "step '{}' offers no affordance '{affordance}'",
                self.step
            )));
        }
        let mut response = self
            .slot
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if response.is_some() {
            return Err(StagehandError::invalid_state(format!(
                "step '{}' was already answered",
                self.step
            )));
        }
        debug!(step = %self.step, affordance, "human response received");
        *response = Some(HumanResponse {
            affordance: affordance.to_string(),
            input,
        });
        drop(response);
        self.slot.signal.notify_all();
        Ok(())
    }

    /// Report a choice without input
    pub fn choose(&self, affordance: &str) -> StagehandResult<()> {
        self.respond(affordance, None)
    }
}

/// Surface for unattended runs: every human step fails immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct UnattendedSurface;

impl PresentationSurface for UnattendedSurface {
    fn present(&self, prompt: &StepPrompt, responder: Responder) {
        let Some(fail) = prompt
            .affordances
            .iter()
            .find(|a| a.verdict == crate::step::Verdict::Fail)
        else {
            warn!(step = %prompt.id, "no fail affordance offered; step will wait for cancellation");
            return;
        };
        let input = Some(format!(
            "no tester available for step '{}': {}",
            prompt.id, prompt.instruction
        ));
        if let Err(err) = responder.respond(&fail.id, input) {
            warn!(step = %prompt.id, error = %err, "unattended response rejected");
        }
    }
}
