//! Requirement resolution
//!
//! Turns the requirements declared for a test into an ordered plan of
//! mutations:
//!
//! 1. Requirements are grouped by dimension.
//! 2. Each group collapses to one target. A group holding any hard
//!    requirement is a conflict unless every member agrees with it. Among
//!    best-effort requirements alone the first declared wins.
//! 3. Conflicts are reported before anything is observed or changed.
//! 4. The plan is ordered by category priority, so users exist before an
//!    owner is installed on them.
//! 5. Targets already in place become no-op mutations that still keep
//!    their place in the plan.

use crate::device::{DeviceServices, StateObserver};
use crate::dimension::{Dimension, StateValue};
use crate::driver::DriverTable;
use crate::mutation::{Mutation, MutationRecord};
use crate::requirement::{FailureMode, Requirement, Strength};
use crate::result::{StagehandError, StagehandResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Ordered mutations for one test attempt
#[derive(Debug, Clone, Default)]
pub struct ResolvedPlan {
    mutations: Vec<Mutation>,
    notes: Vec<String>,
}

impl ResolvedPlan {
    /// Mutations in apply order
    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Consume the plan
    #[must_use]
    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }

    /// Decisions the resolver made that a reader may want to know about
    #[must_use]
    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Number of mutations, including no-ops
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Whether the plan is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Mutations that will change the device
    #[must_use]
    pub fn effective_len(&self) -> usize {
        self.mutations
            .iter()
            .filter(|m| !m.is_planned_noop())
            .count()
    }

    /// Summaries in apply order
    #[must_use]
    pub fn records(&self) -> Vec<MutationRecord> {
        self.mutations.iter().map(Mutation::record).collect()
    }
}

/// One dimension's collapsed target
#[derive(Debug)]
struct Collapsed {
    dimension: Dimension,
    target: StateValue,
    strength: Strength,
    failure_mode: FailureMode,
}

/// Resolves requirements against the current device state
#[derive(Clone)]
pub struct Resolver {
    drivers: DriverTable,
    observer: Arc<dyn StateObserver>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("drivers", &self.drivers)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Create a resolver observing through `services`
    #[must_use]
    pub fn new(drivers: DriverTable, services: &DeviceServices) -> Self {
        Self {
            drivers,
            observer: services.observer().clone(),
        }
    }

    /// Resolve `requirements` into an ordered plan.
    ///
    /// Fails with [`StagehandError::Conflict`] before observing anything if
    /// requirements on one dimension disagree and any of them is hard, and with
    /// [`StagehandError::Unsatisfied`] if a read-only dimension does not hold
    /// a hard requirement's value.
    #[instrument(skip_all, fields(requirements = requirements.len()))]
    pub fn resolve(&self, requirements: &[Requirement]) -> StagehandResult<ResolvedPlan> {
        let mut notes = Vec::new();
        let collapsed = collapse(requirements, &mut notes)?;

        let mut ordered: Vec<Collapsed> = collapsed;
        ordered.sort_by_key(|c| c.dimension.category());

        let mut mutations = Vec::with_capacity(ordered.len());
        for entry in ordered {
            let current = self.observer.observe(&entry.dimension)?;
            let in_place = current == entry.target;

            if !entry.dimension.is_mutable() {
                if !in_place {
                    if entry.strength.is_hard() {
                        return Err(StagehandError::Unsatisfied {
                            dimension: entry.dimension,
                            wanted: entry.target.to_string(),
                            actual: current.to_string(),
                            mode: entry.failure_mode,
                        });
                    }
                    let note = format!(
                        "dropped best-effort {} = {}: read-only and holds {current}",
                        entry.dimension, entry.target
                    );
                    warn!("{note}");
                    notes.push(note);
                    continue;
                }
                mutations.push(
                    Mutation::new(entry.dimension, entry.target, entry.strength, None)
                        .planned_as_noop(true),
                );
                continue;
            }

            let driver = self.drivers.driver_for(&entry.dimension).ok_or_else(|| {
                StagehandError::config(format!(
                    "no driver registered for {:?} dimensions",
                    entry.dimension.category()
                ))
            })?;
            debug!(dimension = %entry.dimension, %current, target = %entry.target, in_place, "planned");
            mutations.push(
                Mutation::new(entry.dimension, entry.target, entry.strength, Some(driver))
                    .planned_as_noop(in_place),
            );
        }

        Ok(ResolvedPlan { mutations, notes })
    }
}

/// Group by dimension and collapse each group to one target
fn collapse(requirements: &[Requirement], notes: &mut Vec<String>) -> StagehandResult<Vec<Collapsed>> {
    let mut groups: BTreeMap<&Dimension, Vec<(&Requirement, StateValue)>> = BTreeMap::new();
    for requirement in requirements {
        let target = requirement.target()?;
        groups
            .entry(&requirement.dimension)
            .or_default()
            .push((requirement, target));
    }

    let mut collapsed = Vec::with_capacity(groups.len());
    for (dimension, group) in groups {
        let hard: Vec<&(&Requirement, StateValue)> =
            group.iter().filter(|(r, _)| r.strength.is_hard()).collect();

        let (winner, winning_target) = if let Some((first, first_target)) = hard.first() {
            if let Some((other, _)) = group.iter().find(|(_, t)| t != first_target) {
                return Err(StagehandError::Conflict {
                    dimension: dimension.clone(),
                    first: first.to_string(),
                    second: other.to_string(),
                });
            }
            (*first, first_target.clone())
        } else {
            let (first, first_target) = &group[0];
            for (other, target) in group.iter().skip(1) {
                if target != first_target {
                    let note = format!("best-effort `{other}` yields to earlier `{first}`");
                    warn!("{note}");
                    notes.push(note);
                }
            }
            (*first, first_target.clone())
        };

        let failure_mode = if group
            .iter()
            .any(|(r, _)| r.strength.is_hard() && r.failure_mode == FailureMode::Fail)
        {
            FailureMode::Fail
        } else {
            winner.failure_mode
        };

        collapsed.push(Collapsed {
            dimension: dimension.clone(),
            target: winning_target,
            strength: winner.strength,
            failure_mode,
        });
    }
    Ok(collapsed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::dimension::DimensionCategory;
    use crate::poll::PollOptions;
    use crate::session::StateSession;
    use crate::sim::SimulatedDevice;
    use proptest::prelude::*;

    fn fast_poll() -> PollOptions {
        PollOptions::new().with_timeout(200).with_interval(1)
    }

    fn resolver_for(device: SimulatedDevice) -> (Resolver, Arc<SimulatedDevice>) {
        let device = Arc::new(device);
        let services = DeviceServices::from_device(device.clone());
        (Resolver::new(DriverTable::standard(), &services), device)
    }

    mod collapse_tests {
        use super::*;

        #[test]
        fn test_hard_conflict_fails_without_observing() {
            let (resolver, device) = resolver_for(SimulatedDevice::new());
            let err = resolver
                .resolve(&[
                    Requirement::must(Dimension::Wifi, true),
                    Requirement::must(Dimension::Wifi, false),
                ])
                .unwrap_err();
            assert!(matches!(err, StagehandError::Conflict { .. }));
            assert_eq!(device.observation_count(), 0);
            assert!(device.command_log().is_empty());
        }

        #[test]
        fn test_must_and_must_not_conflict() {
            let (resolver, _) = resolver_for(SimulatedDevice::new());
            let err = resolver
                .resolve(&[
                    Requirement::must(Dimension::Bluetooth, true),
                    Requirement::must_not(Dimension::Bluetooth, true),
                ])
                .unwrap_err();
            assert!(matches!(err, StagehandError::Conflict { .. }));
        }

        #[test]
        fn test_agreeing_must_and_must_not_merge() {
            let (resolver, _) = resolver_for(SimulatedDevice::new());
            let plan = resolver
                .resolve(&[
                    Requirement::must(Dimension::Wifi, true),
                    Requirement::must_not(Dimension::Wifi, false),
                ])
                .unwrap();
            assert_eq!(plan.len(), 1);
            assert_eq!(plan.mutations()[0].target(), &StateValue::Bool(true));
        }

        #[test]
        fn test_best_effort_disagreeing_with_must_conflicts() {
            let (resolver, device) = resolver_for(SimulatedDevice::new());
            for reqs in [
                [
                    Requirement::must(Dimension::Wifi, true),
                    Requirement::best_effort(Dimension::Wifi, false),
                ],
                [
                    Requirement::best_effort(Dimension::Wifi, false),
                    Requirement::must(Dimension::Wifi, true),
                ],
            ] {
                let err = resolver.resolve(&reqs).unwrap_err();
                assert!(matches!(err, StagehandError::Conflict { .. }), "{err}");
            }
            assert_eq!(device.observation_count(), 0);
        }

        #[test]
        fn test_best_effort_agreeing_with_must_merges() {
            let (resolver, _) = resolver_for(SimulatedDevice::new());
            let plan = resolver
                .resolve(&[
                    Requirement::best_effort(Dimension::Wifi, true),
                    Requirement::must(Dimension::Wifi, true),
                ])
                .unwrap();
            assert_eq!(plan.len(), 1);
            assert_eq!(plan.mutations()[0].strength(), Strength::Must);
            assert!(plan.notes().is_empty());
        }

        #[test]
        fn test_first_best_effort_wins() {
            let (resolver, _) = resolver_for(SimulatedDevice::new());
            let plan = resolver
                .resolve(&[
                    Requirement::best_effort(Dimension::global_setting("locale"), "fr"),
                    Requirement::best_effort(Dimension::global_setting("locale"), "de"),
                ])
                .unwrap();
            assert_eq!(plan.mutations()[0].target(), &StateValue::text("fr"));
        }
    }

    mod ordering_tests {
        use super::*;

        #[test]
        fn test_users_before_owner_before_radio() {
            let (resolver, _) = resolver_for(SimulatedDevice::new());
            let plan = resolver
                .resolve(&[
                    Requirement::must(Dimension::Wifi, true),
                    Requirement::must(Dimension::DeviceOwner, "com.example/.Admin"),
                    Requirement::must(Dimension::user("secondary"), true),
                ])
                .unwrap();
            let dims: Vec<_> = plan.mutations().iter().map(|m| m.dimension().clone()).collect();
            assert_eq!(
                dims,
                vec![
                    Dimension::user("secondary"),
                    Dimension::DeviceOwner,
                    Dimension::Wifi
                ]
            );
        }

        #[test]
        fn test_in_place_targets_are_noops() {
            let (resolver, _) = resolver_for(
                SimulatedDevice::new().with_value(Dimension::Wifi, StateValue::Bool(true)),
            );
            let plan = resolver
                .resolve(&[
                    Requirement::must(Dimension::Wifi, true),
                    Requirement::must(Dimension::Bluetooth, true),
                ])
                .unwrap();
            assert_eq!(plan.len(), 2);
            assert_eq!(plan.effective_len(), 1);
            assert!(plan.mutations()[0].is_planned_noop());
        }
    }

    mod read_only_tests {
        use super::*;

        #[test]
        fn test_missing_feature_unsatisfied_with_mode() {
            let (resolver, _) = resolver_for(SimulatedDevice::new());
            let err = resolver
                .resolve(&[Requirement::must(Dimension::system_feature("nfc"), true).or_skip()])
                .unwrap_err();
            match err {
                StagehandError::Unsatisfied { mode, .. } => assert_eq!(mode, FailureMode::Skip),
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn test_present_feature_is_noop() {
            let (resolver, _) = resolver_for(SimulatedDevice::new().with_value(
                Dimension::system_feature("nfc"),
                StateValue::Bool(true),
            ));
            let plan = resolver
                .resolve(&[Requirement::must(Dimension::system_feature("nfc"), true)])
                .unwrap();
            assert_eq!(plan.effective_len(), 0);
        }

        #[test]
        fn test_best_effort_on_missing_feature_is_dropped() {
            let (resolver, _) = resolver_for(SimulatedDevice::new());
            let plan = resolver
                .resolve(&[Requirement::best_effort(
                    Dimension::system_feature("nfc"),
                    true,
                )])
                .unwrap();
            assert!(plan.is_empty());
            assert_eq!(plan.notes().len(), 1);
        }
    }

    mod idempotence_tests {
        use super::*;

        #[test]
        fn test_resolving_again_after_apply_plans_nothing() {
            let (resolver, device) = resolver_for(SimulatedDevice::new());
            let services = DeviceServices::from_device(device.clone());
            let reqs = [
                Requirement::must(Dimension::user("secondary"), true),
                Requirement::must(Dimension::Wifi, true),
            ];
            let mut first = StateSession::new(services.clone(), fast_poll());
            first
                .apply(resolver.resolve(&reqs).unwrap().into_mutations(), &CancelToken::new())
                .unwrap();

            let again = resolver.resolve(&reqs).unwrap();
            assert_eq!(again.len(), 2);
            assert_eq!(again.effective_len(), 0);

            device.clear_command_log();
            let mut second = StateSession::new(services, fast_poll());
            second
                .apply(again.into_mutations(), &CancelToken::new())
                .unwrap();
            second.teardown().unwrap();
            assert!(device.command_log().is_empty());

            first.teardown().unwrap();
            assert!(device.snapshot().values.is_empty());
        }
    }

    fn any_dimension() -> impl Strategy<Value = Dimension> {
        prop_oneof![
            Just(Dimension::Wifi),
            Just(Dimension::Bluetooth),
            Just(Dimension::CurrentUser),
            "[a-c]".prop_map(Dimension::user),
            "[a-c]".prop_map(Dimension::policy),
            "[a-c]".prop_map(Dimension::global_setting),
            ("[a-b]", "[a-b]").prop_map(|(n, k)| Dimension::feature_flag(n, k)),
        ]
    }

    fn any_strength() -> impl Strategy<Value = Strength> {
        prop_oneof![
            Just(Strength::Must),
            Just(Strength::MustNot),
            Just(Strength::EnsureBestEffort),
        ]
    }

    fn any_requirement() -> impl Strategy<Value = Requirement> {
        (any_dimension(), any::<bool>(), any_strength()).prop_map(|(dimension, flag, strength)| {
            let value = match &dimension {
                Dimension::Wifi | Dimension::Bluetooth | Dimension::UserPresent { .. } => {
                    StateValue::Bool(flag)
                }
                Dimension::Policy { .. } => StateValue::set(if flag { vec!["x"] } else { vec![] }),
                _ => StateValue::text(if flag { "on" } else { "off" }),
            };
            Requirement::new(dimension, value, strength)
        })
    }

    proptest! {
        #[test]
        fn prop_plan_is_category_ordered_and_unique(reqs in prop::collection::vec(any_requirement(), 0..12)) {
            let (resolver, _) = resolver_for(SimulatedDevice::new());
            if let Ok(plan) = resolver.resolve(&reqs) {
                let categories: Vec<DimensionCategory> =
                    plan.mutations().iter().map(|m| m.dimension().category()).collect();
                prop_assert!(categories.windows(2).all(|w| w[0] <= w[1]));
                let mut dims: Vec<&Dimension> = plan.mutations().iter().map(|m| m.dimension()).collect();
                let before = dims.len();
                dims.sort();
                dims.dedup();
                prop_assert_eq!(before, dims.len());
            }
        }

        #[test]
        fn prop_hard_requirements_are_honoured(reqs in prop::collection::vec(any_requirement(), 0..12)) {
            let (resolver, _) = resolver_for(SimulatedDevice::new());
            match resolver.resolve(&reqs) {
                Ok(plan) => {
                    for req in reqs.iter().filter(|r| r.strength.is_hard()) {
                        let target = req.target().unwrap();
                        let mutation = plan
                            .mutations()
                            .iter()
                            .find(|m| m.dimension() == &req.dimension)
                            .unwrap();
                        prop_assert_eq!(mutation.target(), &target);
                    }
                }
                Err(StagehandError::Conflict { dimension, .. }) => {
                    let group: Vec<&Requirement> =
                        reqs.iter().filter(|r| r.dimension == dimension).collect();
                    prop_assert!(group.iter().any(|r| r.strength.is_hard()));
                    let first = group[0].target().unwrap();
                    prop_assert!(group.iter().any(|r| r.target().unwrap() != first));
                }
                Err(StagehandError::Config { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_apply_then_teardown_restores_device(
            seeds in prop::collection::vec(any_requirement(), 0..6),
            reqs in prop::collection::vec(any_requirement(), 0..8),
        ) {
            // a device always has a foreground user
            let device = SimulatedDevice::new()
                .with_value(Dimension::CurrentUser, StateValue::text("system"));
            for seed in &seeds {
                if let Ok(value) = seed.target() {
                    if value != StateValue::Absent {
                        device.set_value(seed.dimension.clone(), value);
                    }
                }
            }
            let (resolver, device) = resolver_for(device);
            let before = device.snapshot();

            if let Ok(plan) = resolver.resolve(&reqs) {
                let mut session =
                    StateSession::new(DeviceServices::from_device(device.clone()), fast_poll());
                let _ = session.apply(plan.into_mutations(), &CancelToken::new());
                prop_assert!(session.teardown().is_ok());
            }
            prop_assert_eq!(device.snapshot(), before);
        }
    }
}
