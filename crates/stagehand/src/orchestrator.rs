//! Test orchestration
//!
//! Runs one test at a time through bounded attempts. Each attempt resolves
//! the test's requirements, applies the plan in a fresh [`StateSession`],
//! runs the body, and always tears down. A body may ask for a restart; the
//! attempt is torn down and the test runs again until the restart budget is
//! spent. Failures before the body are never restarted.
//!
//! ```text
//!  discover ─► [ resolve ─► apply ─► body ─► teardown ]* ─► report
//!                    └─ setup failure: no restart ─┘
//! ```

use crate::automation::AutomationRegistry;
use crate::cancel::{CancelReason, CancelToken};
use crate::config::{OrchestratorConfig, RestartStrategy};
use crate::device::DeviceServices;
use crate::dimension::{Dimension, StateValue};
use crate::driver::DriverTable;
use crate::engine::StepEngine;
use crate::mutation::MutationRecord;
use crate::poll::{Poll, PollOptions};
use crate::report::{AttemptRecord, AttemptResult, Diagnostic, FailureRecord, TestOutcome, TestReport};
use crate::requirement::{FailureMode, Requirement, RequirementSource};
use crate::resolver::{ResolvedPlan, Resolver};
use crate::result::{Phase, StagehandError, StagehandResult};
use crate::session::StateSession;
use crate::step::{StepId, StepResolution, StepSpec};
use crate::surface::{PresentationSurface, UnattendedSurface};
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// BODY RESULTS
// =============================================================================

/// How a test body ends when it does not pass
#[derive(Debug, Error)]
pub enum BodyError {
    /// An assertion failed
    #[error("{0}")]
    Failed(String),
    /// The test should be run again from a clean state
    #[error("restart requested: {0}")]
    RestartRequested(String),
    /// An orchestration error surfaced in the body
    #[error(transparent)]
    Error(#[from] StagehandError),
}

impl BodyError {
    /// Assertion failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Restart request
    pub fn restart(reason: impl Into<String>) -> Self {
        Self::RestartRequested(reason.into())
    }
}

/// Result of a test body
pub type BodyResult = Result<(), BodyError>;

// =============================================================================
// LISTENERS AND CONTROL
// =============================================================================

/// Observes test lifecycle events
pub trait LifecycleListener: Send + Sync {
    /// A test is about to run its first attempt
    fn test_started(&self, _test: &str) {}

    /// A test is about to run attempt `next_attempt` after a restart
    fn test_restarted(&self, _test: &str, _next_attempt: u32, _reason: &str) {}

    /// A test finished with `report`
    fn test_finished(&self, _report: &TestReport) {}
}

#[derive(Debug, Default)]
struct ControlState {
    current: Option<CancelToken>,
    aborted: Option<String>,
}

/// Handle for restarting or aborting the running test from another thread
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    state: Arc<Mutex<ControlState>>,
}

impl RunControl {
    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset(&self) {
        *self.lock() = ControlState::default();
    }

    fn install(&self, token: &CancelToken) {
        let mut state = self.lock();
        if let Some(reason) = &state.aborted {
            token.cancel(CancelReason::Abort(reason.clone()));
        }
        state.current = Some(token.clone());
    }

    fn clear(&self) {
        self.lock().current = None;
    }

    /// Ask the running attempt to restart. Returns `false` if nothing is running.
    pub fn request_restart(&self, reason: impl Into<String>) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|token| token.cancel(CancelReason::Restart(reason.into())))
    }

    /// Abort the running test; no further attempts are made
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut state = self.lock();
        state.aborted = Some(reason.clone());
        state
            .current
            .as_ref()
            .is_some_and(|token| token.cancel(CancelReason::Abort(reason)))
    }
}

/// Cancels the attempt token with [`CancelReason::Timeout`] at the deadline
struct Watchdog {
    disarm: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(target: CancelToken, deadline: Instant) -> Self {
        let disarm = CancelToken::new();
        let disarmed = disarm.clone();
        let handle = thread::Builder::new()
            .name("stagehand-watchdog".into())
            .spawn(move || {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if disarmed.sleep(remaining).is_ok() && target.cancel(CancelReason::Timeout) {
                    warn!("test deadline reached; cancelling attempt");
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "could not start watchdog; test runs without a deadline");
                None
            }
        };
        Self { disarm, handle }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm.cancel(CancelReason::Abort("attempt finished".into()));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// TEST CONTEXT
// =============================================================================

/// What a test body can reach during one attempt
pub struct TestContext<'a> {
    test: &'a str,
    attempt: u32,
    services: &'a DeviceServices,
    steps: &'a StepEngine,
    cancel: CancelToken,
    poll: PollOptions,
    mutations: Vec<MutationRecord>,
}

impl fmt::Debug for TestContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("test", &self.test)
            .field("attempt", &self.attempt)
            .field("mutations", &self.mutations.len())
            .finish_non_exhaustive()
    }
}

impl TestContext<'_> {
    /// Test name
    #[must_use]
    pub const fn test(&self) -> &str {
        self.test
    }

    /// 1-based attempt number
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Device services
    #[must_use]
    pub const fn services(&self) -> &DeviceServices {
        self.services
    }

    /// Token cancelled when the attempt has to stop
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Mutations applied for this attempt, in apply order
    #[must_use]
    pub fn applied_mutations(&self) -> &[MutationRecord] {
        &self.mutations
    }

    /// Observe a dimension
    pub fn observe(&self, dimension: &Dimension) -> StagehandResult<StateValue> {
        self.services.observe(dimension)
    }

    /// Poll preconfigured with this run's timing and cancellation
    pub fn poll<'b, V, F>(&self, what: impl Into<String>, probe: F) -> Poll<'b, V>
    where
        V: fmt::Debug,
        F: FnMut() -> StagehandResult<V> + 'b,
    {
        Poll::for_value(what, probe)
            .with_options(self.poll.clone())
            .cancel_with(&self.cancel)
    }

    /// Wait until `dimension` holds `value`
    pub fn wait_for(&self, dimension: &Dimension, value: StateValue) -> StagehandResult<()> {
        self.poll(format!("{dimension} to become {value}"), || {
            self.services.observe(dimension)
        })
        .to_be_equal_to(value)
        .wait()
        .map(|_| ())
    }

    /// Run an interactive step
    pub fn step<E: Send + 'static>(&self, spec: StepSpec<E>) -> StagehandResult<StepResolution<E>> {
        self.steps.run(spec, &self.cancel)
    }

    /// Run a yes/no step; a fail answer fails the body
    pub fn confirm(&self, id: impl Into<StepId>, instruction: impl Into<String>) -> BodyResult {
        let id = id.into();
        match self.step(StepSpec::confirm(id.clone(), instruction))? {
            StepResolution::Pass(()) => Ok(()),
            StepResolution::Fail(failure) => {
                Err(BodyError::Failed(format!("step '{id}' failed: {failure}")))
            }
        }
    }

    /// Cancel the attempt and ask for a restart
    pub fn request_restart(&self, reason: impl Into<String>) {
        self.cancel.cancel(CancelReason::Restart(reason.into()));
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

enum AttemptVerdict {
    Passed,
    Failed(FailureRecord),
    Restart(String),
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    services: DeviceServices,
    requirements: Arc<dyn RequirementSource>,
    drivers: DriverTable,
    automations: Arc<AutomationRegistry>,
    surface: Arc<dyn PresentationSurface>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("drivers", &self.drivers)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Use `config`
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `drivers` instead of [`DriverTable::standard`]
    #[must_use]
    pub fn drivers(mut self, drivers: DriverTable) -> Self {
        self.drivers = drivers;
        self
    }

    /// Share an automation registry
    #[must_use]
    pub fn automations(mut self, automations: Arc<AutomationRegistry>) -> Self {
        self.automations = automations;
        self
    }

    /// Use `surface` for human steps instead of [`UnattendedSurface`]
    #[must_use]
    pub fn surface(mut self, surface: Arc<dyn PresentationSurface>) -> Self {
        self.surface = surface;
        self
    }

    /// Add a lifecycle listener
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validate the configuration and build
    pub fn build(self) -> StagehandResult<Orchestrator> {
        self.config.validate()?;
        let steps = StepEngine::new(self.automations, self.surface)
            .with_automation_budget(self.config.automation_budget())
            .with_cancel_check_interval(self.config.cancel_check_interval());
        Ok(Orchestrator {
            config: self.config,
            services: self.services,
            requirements: self.requirements,
            drivers: self.drivers,
            steps,
            listeners: self.listeners,
            control: RunControl::default(),
        })
    }
}

/// Runs tests against one device, one at a time
pub struct Orchestrator {
    config: OrchestratorConfig,
    services: DeviceServices,
    requirements: Arc<dyn RequirementSource>,
    drivers: DriverTable,
    steps: StepEngine,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    control: RunControl,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("drivers", &self.drivers)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start building an orchestrator for the device behind `services`
    pub fn builder<R>(services: DeviceServices, requirements: R) -> OrchestratorBuilder
    where
        R: RequirementSource + 'static,
    {
        OrchestratorBuilder {
            config: OrchestratorConfig::default(),
            services,
            requirements: Arc::new(requirements),
            drivers: DriverTable::standard(),
            automations: Arc::new(AutomationRegistry::new()),
            surface: Arc::new(UnattendedSurface),
            listeners: Vec::new(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Automation registry
    #[must_use]
    pub fn automations(&self) -> &Arc<AutomationRegistry> {
        self.steps.automations()
    }

    /// Handle for restarting or aborting the running test
    #[must_use]
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Resolve `test`'s requirements against the current device without applying them
    pub fn plan(&self, test: &str) -> StagehandResult<ResolvedPlan> {
        let requirements = self.requirements.requirements_for(test)?;
        Resolver::new(self.drivers.clone(), &self.services).resolve(&requirements)
    }

    /// Run `test` with `body` and report the outcome.
    ///
    /// Requirements are discovered once. Teardown runs after every attempt
    /// that applied anything, whatever the body did; teardown failures are
    /// reported as diagnostics and never change the outcome.
    #[instrument(skip_all, fields(test = %test))]
    pub fn run<F>(&mut self, test: &str, body: F) -> TestReport
    where
        F: Fn(&TestContext<'_>) -> BodyResult,
    {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = started + self.config.test_timeout();
        self.control.reset();
        self.steps.take_history();
        for listener in &self.listeners {
            listener.test_started(test);
        }
        info!("test started");

        let mut attempts = Vec::new();
        let mut diagnostics = Vec::new();
        let outcome = match self.requirements.requirements_for(test) {
            Ok(requirements) => self.attempt_loop(
                test,
                &requirements,
                deadline,
                &body,
                &mut attempts,
                &mut diagnostics,
            ),
            Err(err) => {
                warn!(error = %err, "requirement discovery failed");
                TestOutcome::Failed {
                    failure: FailureRecord::from_error(Phase::Resolve, &err),
                }
            }
        };
        self.control.clear();

        let report = TestReport {
            test: test.to_string(),
            outcome,
            attempts,
            diagnostics,
            steps: self.steps.take_history(),
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(summary = %report.summary(), "test finished");
        for listener in &self.listeners {
            listener.test_finished(&report);
        }
        report
    }

    fn attempt_loop<F>(
        &self,
        test: &str,
        requirements: &[Requirement],
        deadline: Instant,
        body: &F,
        attempts: &mut Vec<AttemptRecord>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> TestOutcome
    where
        F: Fn(&TestContext<'_>) -> BodyResult,
    {
        let resolver = Resolver::new(self.drivers.clone(), &self.services);
        let mut carried: Option<StateSession> = None;
        let mut restarts = 0u32;

        loop {
            let number = attempts.len() as u32 + 1;
            let attempt_started = Instant::now();
            let token = CancelToken::new();
            self.control.install(&token);
            let watchdog = Watchdog::arm(token.clone(), deadline);

            let mut session = match self.prepare(
                &resolver,
                requirements,
                carried.take(),
                &token,
                number,
                diagnostics,
            ) {
                Ok(session) => session,
                Err((phase, err)) => {
                    drop(watchdog);
                    let timed_out = matches!(err.cancel_reason(), Some(CancelReason::Timeout));
                    let err = if timed_out { self.timeout_error(test) } else { err };
                    let (result, outcome) = match &err {
                        StagehandError::Unsatisfied {
                            mode: FailureMode::Skip,
                            ..
                        } => (
                            AttemptResult::Skipped,
                            TestOutcome::Skipped {
                                reason: err.to_string(),
                            },
                        ),
                        _ => (
                            AttemptResult::Failed,
                            TestOutcome::Failed {
                                failure: FailureRecord::from_error(phase, &err),
                            },
                        ),
                    };
                    warn!(attempt = number, %phase, error = %err, "setup did not complete");
                    attempts.push(AttemptRecord {
                        number,
                        session: None,
                        result,
                        restart_reason: None,
                        mutations: Vec::new(),
                        duration_ms: attempt_started.elapsed().as_millis() as u64,
                    });
                    return outcome;
                }
            };

            let mutations = session.records();
            let ctx = TestContext {
                test,
                attempt: number,
                services: &self.services,
                steps: &self.steps,
                cancel: token.clone(),
                poll: self.config.poll_options(),
                mutations: mutations.clone(),
            };
            debug!(attempt = number, mutations = mutations.len(), "running body");
            let body_result = body(&ctx);
            drop(ctx);
            drop(watchdog);
            let verdict = self.classify(test, body_result, token.reason());

            let exhausted = matches!(verdict, AttemptVerdict::Restart(_))
                && restarts >= self.config.max_restarts;
            let keep_for_restart = matches!(verdict, AttemptVerdict::Restart(_))
                && !exhausted
                && self.config.restart_strategy == RestartStrategy::ReapplyPlan;
            if !keep_for_restart {
                if let Err(err) = session.teardown() {
                    warn!(attempt = number, error = %err, "teardown failed");
                    diagnostics.extend(Diagnostic::from_error(Phase::Teardown, number, &err));
                }
            }

            let (result, restart_reason) = match &verdict {
                AttemptVerdict::Passed => (AttemptResult::Passed, None),
                AttemptVerdict::Failed(_) => (AttemptResult::Failed, None),
                AttemptVerdict::Restart(reason) if exhausted => {
                    (AttemptResult::Failed, Some(reason.clone()))
                }
                AttemptVerdict::Restart(reason) => (AttemptResult::Restarted, Some(reason.clone())),
            };
            attempts.push(AttemptRecord {
                number,
                session: Some(session.id()),
                result,
                restart_reason,
                mutations,
                duration_ms: attempt_started.elapsed().as_millis() as u64,
            });

            match verdict {
                AttemptVerdict::Passed => return TestOutcome::Passed,
                AttemptVerdict::Failed(failure) => return TestOutcome::Failed { failure },
                AttemptVerdict::Restart(reason) => {
                    if exhausted {
                        let err = StagehandError::TooManyRestarts { restarts, reason };
                        warn!(error = %err, "giving up");
                        return TestOutcome::Failed {
                            failure: FailureRecord::from_error(Phase::Body, &err),
                        };
                    }
                    if Instant::now() >= deadline {
                        return TestOutcome::Failed {
                            failure: FailureRecord::from_error(Phase::Body, &self.timeout_error(test)),
                        };
                    }
                    restarts += 1;
                    warn!(attempt = number, restarts, %reason, "restarting test");
                    for listener in &self.listeners {
                        listener.test_restarted(test, number + 1, &reason);
                    }
                    if keep_for_restart {
                        carried = Some(session);
                    }
                }
            }
        }
    }

    /// Resolve and apply, or re-apply a carried session
    fn prepare(
        &self,
        resolver: &Resolver,
        requirements: &[Requirement],
        carried: Option<StateSession>,
        token: &CancelToken,
        attempt: u32,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<StateSession, (Phase, StagehandError)> {
        let (mut session, applied) = match carried {
            Some(mut session) => {
                let applied = session.restart(token);
                (session, applied)
            }
            None => {
                let plan = resolver
                    .resolve(requirements)
                    .map_err(|err| (Phase::Resolve, err))?;
                for note in plan.notes() {
                    debug!(attempt, note = %note, "resolver note");
                }
                let mut session =
                    StateSession::new(self.services.clone(), self.config.poll_options());
                let applied = session.apply(plan.into_mutations(), token);
                (session, applied)
            }
        };
        for err in session.take_diagnostics() {
            diagnostics.extend(Diagnostic::from_error(Phase::Teardown, attempt, &err));
        }
        applied
            .map(|()| session)
            .map_err(|err| (Phase::Apply, err))
    }

    fn classify(
        &self,
        test: &str,
        result: BodyResult,
        cancelled: Option<CancelReason>,
    ) -> AttemptVerdict {
        match cancelled {
            Some(CancelReason::Restart(reason)) => return AttemptVerdict::Restart(reason),
            Some(CancelReason::Timeout) => {
                return AttemptVerdict::Failed(FailureRecord::from_error(
                    Phase::Body,
                    &self.timeout_error(test),
                ));
            }
            Some(reason @ CancelReason::Abort(_)) => {
                return AttemptVerdict::Failed(FailureRecord::from_error(
                    Phase::Body,
                    &StagehandError::Cancelled { reason },
                ));
            }
            None => {}
        }
        match result {
            Ok(()) => AttemptVerdict::Passed,
            Err(BodyError::RestartRequested(reason)) => AttemptVerdict::Restart(reason),
            Err(BodyError::Failed(message)) => {
                AttemptVerdict::Failed(FailureRecord::new(Phase::Body, message))
            }
            Err(BodyError::Error(err)) => {
                AttemptVerdict::Failed(FailureRecord::from_error(Phase::Body, &err))
            }
        }
    }

    fn timeout_error(&self, test: &str) -> StagehandError {
        StagehandError::Timeout {
            what: format!("test '{test}'"),
            elapsed_ms: self.config.test_timeout_ms,
            last_observed: None,
        }
    }
}
