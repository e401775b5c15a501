//! Step engine
//!
//! Runs interactive steps one at a time. A step with a bound automation runs
//! it on a worker thread under a time budget; otherwise the step is shown on
//! the presentation surface and the engine waits for a human answer,
//! checking for cancellation at a fixed interval.

use crate::automation::{Automation, AutomationRegistry};
use crate::cancel::CancelToken;
use crate::result::{StagehandError, StagehandResult};
use crate::step::{
    HumanResponse, ResolvedBy, Step, StepFailure, StepId, StepRecord, StepResolution, StepSpec,
    StepState,
};
use crate::surface::{PresentationSurface, Responder, ResponseSlot, StepPrompt};
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default time an automation may take before the step fails (30 seconds)
pub const DEFAULT_AUTOMATION_BUDGET_MS: u64 = 30_000;

/// Default interval between cancellation checks while waiting (50ms)
pub const DEFAULT_CANCEL_CHECK_INTERVAL_MS: u64 = 50;

/// Runs steps sequentially and keeps their history
pub struct StepEngine {
    automations: Arc<AutomationRegistry>,
    surface: Arc<dyn PresentationSurface>,
    automation_budget: Duration,
    cancel_check_interval: Duration,
    active: Mutex<Option<StepId>>,
    history: Mutex<Vec<StepRecord>>,
}

impl fmt::Debug for StepEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepEngine")
            .field("automations", &self.automations)
            .field("automation_budget", &self.automation_budget)
            .field("cancel_check_interval", &self.cancel_check_interval)
            .finish_non_exhaustive()
    }
}

/// Clears the active step when dropped
struct ActiveGuard<'a> {
    active: &'a Mutex<Option<StepId>>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl StepEngine {
    /// Create an engine
    #[must_use]
    pub fn new(automations: Arc<AutomationRegistry>, surface: Arc<dyn PresentationSurface>) -> Self {
        Self {
            automations,
            surface,
            automation_budget: Duration::from_millis(DEFAULT_AUTOMATION_BUDGET_MS),
            cancel_check_interval: Duration::from_millis(DEFAULT_CANCEL_CHECK_INTERVAL_MS),
            active: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Set the automation time budget
    #[must_use]
    pub const fn with_automation_budget(mut self, budget: Duration) -> Self {
        self.automation_budget = budget;
        self
    }

    /// Set how often a waiting step checks for cancellation
    #[must_use]
    pub const fn with_cancel_check_interval(mut self, interval: Duration) -> Self {
        self.cancel_check_interval = interval;
        self
    }

    /// Automation registry
    #[must_use]
    pub fn automations(&self) -> &Arc<AutomationRegistry> {
        &self.automations
    }

    /// Resolved steps so far
    #[must_use]
    pub fn history(&self) -> Vec<StepRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take and clear the history
    pub fn take_history(&self) -> Vec<StepRecord> {
        std::mem::take(&mut *self.history.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Run `spec` to resolution.
    ///
    /// Returns `Err(Cancelled)` if `cancel` fires first; the step is then
    /// aborted and nothing is recorded. Fails with `InvalidState` if another
    /// step is still running.
    pub fn run<E: Send + 'static>(
        &self,
        spec: StepSpec<E>,
        cancel: &CancelToken,
    ) -> StagehandResult<StepResolution<E>> {
        cancel.check()?;
        let _guard = self.enter(spec.id())?;
        let started = Instant::now();
        let mut step = Step::new(spec.id().clone(), spec.instruction());
        let prompt = StepPrompt {
            id: spec.id().clone(),
            instruction: spec.instruction().to_string(),
            affordances: spec.affordances().to_vec(),
        };

        let resolved_by = match self.automations.lookup::<E>(spec.id()) {
            Some(automation) => {
                step.transition(StepState::Automated)?;
                info!(step = %prompt.id, "running automation");
                self.run_automation(&mut step, automation, &prompt, cancel)?;
                ResolvedBy::Automation
            }
            None => {
                step.transition(StepState::AwaitingHuman)?;
                info!(step = %prompt.id, "awaiting tester");
                self.await_human(&mut step, &spec, &prompt, cancel)?;
                ResolvedBy::Human
            }
        };

        let resolution = step
            .take_result()
            .ok_or_else(|| StagehandError::invalid_state("resolved step has no result"))?;
        let reason = match &resolution {
            StepResolution::Pass(_) => None,
            StepResolution::Fail(failure) => Some(failure.reason.clone()),
        };
        info!(step = %prompt.id, verdict = ?resolution.verdict(), ?resolved_by, "step resolved");
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StepRecord {
                id: prompt.id,
                instruction: prompt.instruction,
                resolved_by,
                verdict: resolution.verdict(),
                reason,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        Ok(resolution)
    }

    fn enter(&self, id: &StepId) -> StagehandResult<ActiveGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = active.as_ref() {
            return Err(StagehandError::invalid_state(format!(
                "step '{current}' is still running; cannot start '{id}'"
            )));
        }
        *active = Some(id.clone());
        Ok(ActiveGuard {
            active: &self.active,
        })
    }

    fn run_automation<E: Send + 'static>(
        &self,
        step: &mut Step<E>,
        automation: Arc<dyn Automation<E>>,
        prompt: &StepPrompt,
        cancel: &CancelToken,
    ) -> StagehandResult<()> {
        let (tx, rx) = mpsc::channel();
        let worker_prompt = prompt.clone();
        thread::Builder::new()
            .name(format!("automation-{}", prompt.id))
            .spawn(move || {
                let outcome = automation.resolve(&worker_prompt);
                // Receiver is gone if the step was aborted or timed out
                let _ = tx.send(outcome);
            })?;

        let deadline = Instant::now() + self.automation_budget;
        loop {
            if let Some(reason) = cancel.reason() {
                warn!(step = %prompt.id, %reason, "automation aborted");
                step.abort()?;
                return Err(StagehandError::Cancelled { reason });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let budget_ms = self.automation_budget.as_millis() as u64;
                warn!(step = %prompt.id, budget_ms, "automation exceeded its budget");
                return step.resolve(StepResolution::Fail(StepFailure::from_error(
                    StagehandError::Timeout {
                        what: format!("automation for step '{}'", prompt.id),
                        elapsed_ms: budget_ms,
                        last_observed: None,
                    },
                )));
            }
            match rx.recv_timeout(remaining.min(self.cancel_check_interval)) {
                Ok(Ok(value)) => return step.resolve(StepResolution::Pass(value)),
                Ok(Err(err)) => {
                    warn!(step = %prompt.id, error = %err, "automation failed");
                    return step.resolve(StepResolution::Fail(StepFailure::from_error(err)));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return step.resolve(StepResolution::Fail(StepFailure::new(format!(
                        "automation for step '{}' panicked",
                        prompt.id
                    ))));
                }
            }
        }
    }

    fn await_human<E>(
        &self,
        step: &mut Step<E>,
        spec: &StepSpec<E>,
        prompt: &StepPrompt,
        cancel: &CancelToken,
    ) -> StagehandResult<()> {
        let slot = Arc::new(ResponseSlot::default());
        self.surface.present(
            prompt,
            Responder::new(prompt.id.clone(), prompt.affordances.clone(), slot.clone()),
        );

        loop {
            if let Some(response) = slot.wait(self.cancel_check_interval) {
                self.surface.withdraw(&prompt.id);
                return settle(step, spec, &response);
            }
            if let Some(reason) = cancel.reason() {
                warn!(step = %prompt.id, %reason, "human step aborted");
                self.surface.withdraw(&prompt.id);
                step.abort()?;
                return Err(StagehandError::Cancelled { reason });
            }
        }
    }
}

/// Resolve `step` from a human answer; an answer that cannot be read aborts it
fn settle<E>(step: &mut Step<E>, spec: &StepSpec<E>, response: &HumanResponse) -> StagehandResult<()> {
    match spec.interpret(response) {
        Ok(resolution) => step.resolve(resolution),
        Err(err) => {
            warn!(step = %step.id(), error = %err, "answer could not be interpreted");
            step.abort()?;
            Err(err)
        }
    }
}
