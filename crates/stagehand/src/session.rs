//! State sessions
//!
//! A [`StateSession`] owns the mutations applied for one test attempt. The
//! stack only grows while applying and only shrinks during teardown, which
//! undoes in strict reverse apply order. If any apply fails, everything
//! applied so far (including the mutation that failed halfway) is torn down
//! before the failure is reported.

use crate::cancel::CancelToken;
use crate::device::DeviceServices;
use crate::mutation::{Mutation, MutationRecord};
use crate::poll::PollOptions;
use crate::result::{StagehandError, StagehandResult, UndoFailure};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Applied mutations for one test attempt
#[derive(Debug)]
pub struct StateSession {
    id: Uuid,
    services: DeviceServices,
    poll: PollOptions,
    plan: Vec<Mutation>,
    applied: Vec<Mutation>,
    next_seq: u64,
    diagnostics: Vec<StagehandError>,
}

impl StateSession {
    /// Create an empty session
    #[must_use]
    pub fn new(services: DeviceServices, poll: PollOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            services,
            poll,
            plan: Vec::new(),
            applied: Vec::new(),
            next_seq: 0,
            diagnostics: Vec::new(),
        }
    }

    /// Session identifier
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Number of mutations currently on the stack
    #[must_use]
    pub fn applied_len(&self) -> usize {
        self.applied.len()
    }

    /// Whether nothing is left to undo
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.applied.is_empty()
    }

    /// Summaries of the mutations on the stack, in apply order
    #[must_use]
    pub fn records(&self) -> Vec<MutationRecord> {
        self.applied.iter().map(Mutation::record).collect()
    }

    /// Teardown errors raised while rolling back a failed apply or a restart
    pub fn take_diagnostics(&mut self) -> Vec<StagehandError> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Apply `mutations` in order, pushing each onto the stack.
    ///
    /// On failure the stack is torn down and the error is wrapped in
    /// [`StagehandError::SetupFailed`]. Rollback errors are kept as
    /// diagnostics.
    #[instrument(skip_all, fields(session = %self.id, mutations = mutations.len()))]
    pub fn apply(&mut self, mutations: Vec<Mutation>, cancel: &CancelToken) -> StagehandResult<()> {
        if !self.applied.is_empty() {
            return Err(StagehandError::invalid_state(
                "session still holds applied mutations; tear down first",
            ));
        }
        self.plan = mutations.iter().map(Mutation::fresh).collect();

        for mut mutation in mutations {
            let seq = self.next_seq;
            self.next_seq += 1;
            match mutation.apply(&self.services, seq, &self.poll, cancel) {
                Ok(()) => self.applied.push(mutation),
                Err(cause) => {
                    let dimension = mutation.dimension().clone();
                    warn!(%dimension, seq, error = %cause, "apply failed; rolling back");
                    if mutation.needs_undo() {
                        self.applied.push(mutation);
                    }
                    if let Err(rollback) = self.teardown() {
                        warn!(error = %rollback, "rollback after failed apply did not complete");
                        self.diagnostics.push(rollback);
                    }
                    return Err(StagehandError::SetupFailed {
                        dimension,
                        source: Box::new(cause),
                    });
                }
            }
        }
        info!(applied = self.applied.len(), "session applied");
        Ok(())
    }

    /// Undo every applied mutation in reverse order.
    ///
    /// Every undo is attempted even if earlier ones fail; failures are
    /// returned together. Calling again after a teardown does nothing.
    #[instrument(skip_all, fields(session = %self.id, applied = self.applied.len()))]
    pub fn teardown(&mut self) -> StagehandResult<()> {
        let mut failures = Vec::new();
        while let Some(mut mutation) = self.applied.pop() {
            if let Err(cause) = mutation.undo(&self.services, &self.poll) {
                warn!(dimension = %mutation.dimension(), error = %cause, "undo failed");
                failures.push(UndoFailure {
                    dimension: mutation.dimension().clone(),
                    seq: mutation.seq().unwrap_or_default(),
                    cause: Box::new(cause),
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StagehandError::Teardown { failures })
        }
    }

    /// Tear down and re-apply the last applied plan from scratch.
    ///
    /// Teardown errors are kept as diagnostics; re-application proceeds.
    pub fn restart(&mut self, cancel: &CancelToken) -> StagehandResult<()> {
        info!(session = %self.id, "restarting session");
        if let Err(err) = self.teardown() {
            self.diagnostics.push(err);
        }
        let plan: Vec<Mutation> = self.plan.iter().map(Mutation::fresh).collect();
        self.apply(plan, cancel)
    }
}

impl Drop for StateSession {
    fn drop(&mut self) {
        if self.applied.is_empty() {
            return;
        }
        warn!(session = %self.id, pending = self.applied.len(), "session dropped with applied mutations; tearing down");
        // Best effort teardown - errors were already logged per undo
        let _ = self.teardown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dimension::{Dimension, StateValue};
    use crate::driver::DriverTable;
    use crate::requirement::Strength;
    use crate::sim::SimulatedDevice;
    use std::sync::Arc;

    fn fast_poll() -> PollOptions {
        PollOptions::new().with_timeout(200).with_interval(1)
    }

    fn mutation(dimension: Dimension, target: StateValue) -> Mutation {
        let driver = DriverTable::standard().driver_for(&dimension);
        Mutation::new(dimension, target, Strength::Must, driver)
    }

    fn three_mutations() -> Vec<Mutation> {
        vec![
            mutation(Dimension::user("secondary"), StateValue::Bool(true)),
            mutation(Dimension::global_setting("adb_enabled"), StateValue::Int(1)),
            mutation(Dimension::Wifi, StateValue::Bool(true)),
        ]
    }

    fn session(device: &Arc<SimulatedDevice>) -> StateSession {
        StateSession::new(DeviceServices::from_device(device.clone()), fast_poll())
    }

    mod apply_tests {
        use super::*;

        #[test]
        fn test_teardown_reverses_apply_order() {
            let device = Arc::new(SimulatedDevice::new());
            let mut session = session(&device);
            session.apply(three_mutations(), &CancelToken::new()).unwrap();
            let seqs: Vec<_> = session.records().iter().map(|r| r.seq).collect();
            assert_eq!(seqs, vec![Some(0), Some(1), Some(2)]);

            device.clear_command_log();
            session.teardown().unwrap();
            assert_eq!(
                device.command_log(),
                vec![
                    "svc wifi disable",
                    "settings delete global adb_enabled",
                    "pm remove-user --user-type secondary",
                ]
            );
            assert!(device.snapshot().values.is_empty());
        }

        #[test]
        fn test_failed_apply_rolls_back_prefix() {
            let device = Arc::new(SimulatedDevice::new());
            device.fail_next("svc wifi enable");
            let mut session = session(&device);
            let err = session
                .apply(three_mutations(), &CancelToken::new())
                .unwrap_err();
            match &err {
                StagehandError::SetupFailed { dimension, source } => {
                    assert_eq!(dimension, &Dimension::Wifi);
                    assert!(matches!(**source, StagehandError::Command { .. }));
                }
                other => panic!("unexpected error: {other}"),
            }
            assert!(session.is_clean());
            assert_eq!(device.value(&Dimension::user("secondary")), StateValue::Bool(false));
            assert_eq!(
                device.value(&Dimension::global_setting("adb_enabled")),
                StateValue::Absent
            );
        }

        #[test]
        fn test_apply_on_dirty_session_rejected() {
            let device = Arc::new(SimulatedDevice::new());
            let mut session = session(&device);
            session.apply(three_mutations(), &CancelToken::new()).unwrap();
            assert!(session.apply(three_mutations(), &CancelToken::new()).is_err());
            session.teardown().unwrap();
        }
    }

    mod teardown_tests {
        use super::*;

        #[test]
        fn test_undo_failures_are_collected_and_others_still_run() {
            let device = Arc::new(SimulatedDevice::new());
            let mut session = session(&device);
            session.apply(three_mutations(), &CancelToken::new()).unwrap();
            device.fail_next("settings delete global adb_enabled");

            let err = session.teardown().unwrap_err();
            match err {
                StagehandError::Teardown { failures } => {
                    assert_eq!(failures.len(), 1);
                    assert_eq!(failures[0].seq, 1);
                }
                other => panic!("unexpected error: {other}"),
            }
            assert_eq!(device.value(&Dimension::Wifi), StateValue::Bool(false));
            assert_eq!(device.value(&Dimension::user("secondary")), StateValue::Bool(false));
        }

        #[test]
        fn test_second_teardown_is_noop() {
            let device = Arc::new(SimulatedDevice::new());
            let mut session = session(&device);
            session.apply(three_mutations(), &CancelToken::new()).unwrap();
            session.teardown().unwrap();
            let commands = device.command_log().len();
            session.teardown().unwrap();
            assert_eq!(device.command_log().len(), commands);
        }

        #[test]
        fn test_drop_tears_down() {
            let device = Arc::new(SimulatedDevice::new());
            {
                let mut session = session(&device);
                session.apply(three_mutations(), &CancelToken::new()).unwrap();
            }
            assert!(device.snapshot().values.is_empty());
        }
    }

    #[test]
    fn test_restart_reapplies_plan() {
        let device = Arc::new(SimulatedDevice::new());
        let mut session = session(&device);
        session.apply(three_mutations(), &CancelToken::new()).unwrap();
        device.set_value(Dimension::Wifi, StateValue::Bool(false));

        session.restart(&CancelToken::new()).unwrap();
        assert_eq!(session.applied_len(), 3);
        assert_eq!(device.value(&Dimension::Wifi), StateValue::Bool(true));
        let seqs: Vec<_> = session.records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![Some(3), Some(4), Some(5)]);
        session.teardown().unwrap();
    }
}
