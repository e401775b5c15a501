//! Test doubles
//!
//! Available to this crate's tests and, with the `test-support` feature,
//! to downstream suites.

use crate::orchestrator::LifecycleListener;
use crate::report::{TestOutcome, TestReport};
use crate::step::StepId;
use crate::surface::{PresentationSurface, Responder, StepPrompt};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Surface that answers presented steps from a queue.
///
/// Each presented step takes the next queued answer and responds
/// synchronously. With nothing queued the step is left waiting until it is
/// cancelled.
#[derive(Debug, Default)]
pub struct ScriptedSurface {
    answers: Mutex<VecDeque<(String, Option<String>)>>,
    presented: Mutex<Vec<StepPrompt>>,
    withdrawn: Mutex<Vec<StepId>>,
}

impl ScriptedSurface {
    /// Surface with no queued answers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a choice of `affordance`
    #[must_use]
    pub fn answer(self, affordance: impl Into<String>) -> Self {
        self.push_answer(affordance, None);
        self
    }

    /// Queue a choice of `affordance` with free-text input
    #[must_use]
    pub fn answer_with(self, affordance: impl Into<String>, input: impl Into<String>) -> Self {
        self.push_answer(affordance, Some(input.into()));
        self
    }

    /// Queue an answer on a shared surface
    pub fn push_answer(&self, affordance: impl Into<String>, input: Option<String>) {
        lock(&self.answers).push_back((affordance.into(), input));
    }

    /// Prompts presented so far
    #[must_use]
    pub fn presented(&self) -> Vec<StepPrompt> {
        lock(&self.presented).clone()
    }

    /// Steps withdrawn so far
    #[must_use]
    pub fn withdrawn(&self) -> Vec<StepId> {
        lock(&self.withdrawn).clone()
    }
}

impl PresentationSurface for ScriptedSurface {
    fn present(&self, prompt: &StepPrompt, responder: Responder) {
        lock(&self.presented).push(prompt.clone());
        let next = lock(&self.answers).pop_front();
        match next {
            Some((affordance, input)) => {
                if let Err(err) = responder.respond(&affordance, input) {
                    debug!(step = %prompt.id, error = %err, "scripted answer rejected");
                }
            }
            None => debug!(step = %prompt.id, "no scripted answer; step left waiting"),
        }
    }

    fn withdraw(&self, step: &StepId) {
        lock(&self.withdrawn).push(step.clone());
    }
}

/// Listener that records lifecycle events as strings:
/// `started:<test>`, `restarted:<test>:<attempt>:<reason>` and
/// `finished:<test>:<passed|failed|skipped>`.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events so far
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }
}

impl LifecycleListener for RecordingListener {
    fn test_started(&self, test: &str) {
        lock(&self.events).push(format!("started:{test}"));
    }

    fn test_restarted(&self, test: &str, next_attempt: u32, reason: &str) {
        lock(&self.events).push(format!("restarted:{test}:{next_attempt}:{reason}"));
    }

    fn test_finished(&self, report: &TestReport) {
        let status = match report.outcome {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed { .. } => "failed",
            TestOutcome::Skipped { .. } => "skipped",
        };
        lock(&self.events).push(format!("finished:{}:{status}", report.test));
    }
}
