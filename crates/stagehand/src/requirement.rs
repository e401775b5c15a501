//! Requirements: what a test declares about device state.

use crate::dimension::{Dimension, StateValue};
use crate::result::{StagehandError, StagehandResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// How strongly a requirement binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    /// The dimension must hold the value
    #[default]
    Must,
    /// The dimension must not hold the value
    MustNot,
    /// Set the value if nothing stronger disagrees
    EnsureBestEffort,
}

impl Strength {
    /// Whether disagreement with this requirement is a conflict
    #[must_use]
    pub const fn is_hard(self) -> bool {
        matches!(self, Self::Must | Self::MustNot)
    }
}

/// What happens when a read-only requirement is not met
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Report the test as failed
    #[default]
    Fail,
    /// Report the test as skipped
    Skip,
}

/// A declared constraint on one dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    /// Constrained dimension
    pub dimension: Dimension,
    /// Declared value
    pub value: StateValue,
    /// Binding strength
    #[serde(default)]
    pub strength: Strength,
    /// Behaviour when a read-only dimension disagrees
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl Requirement {
    /// Create a requirement
    #[must_use]
    pub fn new(dimension: Dimension, value: impl Into<StateValue>, strength: Strength) -> Self {
        Self {
            dimension,
            value: value.into(),
            strength,
            failure_mode: FailureMode::Fail,
        }
    }

    /// `dimension` must hold `value`
    #[must_use]
    pub fn must(dimension: Dimension, value: impl Into<StateValue>) -> Self {
        Self::new(dimension, value, Strength::Must)
    }

    /// `dimension` must not hold `value`
    #[must_use]
    pub fn must_not(dimension: Dimension, value: impl Into<StateValue>) -> Self {
        Self::new(dimension, value, Strength::MustNot)
    }

    /// Set `dimension` to `value` unless a hard requirement disagrees
    #[must_use]
    pub fn best_effort(dimension: Dimension, value: impl Into<StateValue>) -> Self {
        Self::new(dimension, value, Strength::EnsureBestEffort)
    }

    /// Skip instead of failing when this read-only requirement is unmet
    #[must_use]
    pub const fn or_skip(mut self) -> Self {
        self.failure_mode = FailureMode::Skip;
        self
    }

    /// Concrete value the device must hold to meet this requirement.
    ///
    /// `MustNot` on a boolean negates it. `MustNot` on any other value
    /// means the dimension must be cleared. `MustNot` on `Absent` cannot be
    /// expressed as a single target and is rejected.
    pub fn target(&self) -> StagehandResult<StateValue> {
        match (self.strength, &self.value) {
            (Strength::MustNot, StateValue::Bool(value)) => Ok(StateValue::Bool(!value)),
            (Strength::MustNot, StateValue::Absent) => Err(StagehandError::config(format!(
                "must_not absent on {} has no single target value",
                self.dimension
            ))),
            (Strength::MustNot, _) => Ok(StateValue::Absent),
            (_, value) => Ok(value.clone()),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strength = match self.strength {
            Strength::Must => "must",
            Strength::MustNot => "must_not",
            Strength::EnsureBestEffort => "best_effort",
        };
        write!(f, "{strength} {} = {}", self.dimension, self.value)
    }
}

// =============================================================================
// SOURCES
// =============================================================================

/// Supplies the requirements declared for a test.
///
/// Called once per test, before the first attempt.
pub trait RequirementSource: Send + Sync {
    /// Requirements declared by `test`
    fn requirements_for(&self, test: &str) -> StagehandResult<Vec<Requirement>>;
}

impl<F> RequirementSource for F
where
    F: Fn(&str) -> StagehandResult<Vec<Requirement>> + Send + Sync,
{
    fn requirements_for(&self, test: &str) -> StagehandResult<Vec<Requirement>> {
        self(test)
    }
}

/// Requirements declared up front, per test, with an optional shared base.
///
/// Deserializes from YAML:
///
/// ```yaml
/// common:
///   - dimension: { kind: wifi }
///     value: true
/// tests:
///   enrolls_work_profile:
///     - dimension: { kind: user_present, user_type: work_profile }
///       value: true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementCatalog {
    /// Requirements every test inherits, declared before its own
    #[serde(default)]
    pub common: Vec<Requirement>,
    /// Per-test requirements
    #[serde(default)]
    pub tests: HashMap<String, Vec<Requirement>>,
}

impl RequirementCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a requirement shared by every test
    #[must_use]
    pub fn with_common(mut self, requirement: Requirement) -> Self {
        self.common.push(requirement);
        self
    }

    /// Add a requirement for one test
    #[must_use]
    pub fn with_requirement(mut self, test: impl Into<String>, requirement: Requirement) -> Self {
        self.tests.entry(test.into()).or_default().push(requirement);
        self
    }

    /// Parse a catalog from YAML
    pub fn from_yaml(yaml: &str) -> StagehandResult<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }
}

impl RequirementSource for RequirementCatalog {
    fn requirements_for(&self, test: &str) -> StagehandResult<Vec<Requirement>> {
        let mut requirements = self.common.clone();
        if let Some(own) = self.tests.get(test) {
            requirements.extend(own.iter().cloned());
        }
        Ok(requirements)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_must_not_bool_negates() {
        let req = Requirement::must_not(Dimension::Wifi, true);
        assert_eq!(req.target().unwrap(), StateValue::Bool(false));
    }

    #[test]
    fn test_must_not_component_clears() {
        let req = Requirement::must_not(Dimension::DeviceOwner, "com.example/.Admin");
        assert_eq!(req.target().unwrap(), StateValue::Absent);
    }

    #[test]
    fn test_must_not_absent_rejected() {
        let req = Requirement::must_not(Dimension::DeviceOwner, StateValue::Absent);
        assert!(req.target().is_err());
    }

    #[test]
    fn test_hardness() {
        assert!(Strength::Must.is_hard());
        assert!(Strength::MustNot.is_hard());
        assert!(!Strength::EnsureBestEffort.is_hard());
    }

    #[test]
    fn test_catalog_from_yaml_merges_common_first() {
        let catalog = RequirementCatalog::from_yaml(
            r"
common:
  - dimension: { kind: wifi }
    value: true
tests:
  enrolls:
    - dimension: { kind: user_present, user_type: work_profile }
      value: true
      strength: ensure_best_effort
",
        )
        .unwrap();
        let reqs = catalog.requirements_for("enrolls").unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].dimension, Dimension::Wifi);
        assert_eq!(reqs[1].strength, Strength::EnsureBestEffort);
        assert_eq!(catalog.requirements_for("unknown").unwrap().len(), 1);
    }

    #[test]
    fn test_closure_source() {
        let source = |test: &str| -> StagehandResult<Vec<Requirement>> {
            Ok(vec![Requirement::must(Dimension::global_setting(test), "1")])
        };
        let reqs = source.requirements_for("adb_enabled").unwrap();
        assert_eq!(reqs[0].dimension, Dimension::global_setting("adb_enabled"));
    }
}
