//! Orchestrator configuration
//!
//! Loaded from YAML; every field has a default, so an empty file (or no
//! file at all) is a valid configuration.

use crate::engine::{DEFAULT_AUTOMATION_BUDGET_MS, DEFAULT_CANCEL_CHECK_INTERVAL_MS};
use crate::poll::{ErrorPolicy, PollOptions, DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_TIMEOUT_MS};
use crate::result::{StagehandError, StagehandResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default restart budget per test
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Default per-test deadline: ten minutes less a two second margin
pub const DEFAULT_TEST_TIMEOUT_MS: u64 = 600_000 - 2_000;

/// What a restart re-runs before the body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Tear down, then resolve again against fresh device state
    #[default]
    ReResolve,
    /// Tear down, then re-apply the previous plan without resolving
    ReapplyPlan,
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Restarts allowed per test
    pub max_restarts: u32,
    /// Deadline across all attempts of one test, in milliseconds
    pub test_timeout_ms: u64,
    /// Interval between convergence probes, in milliseconds
    pub poll_interval_ms: u64,
    /// Convergence deadline per mutation, in milliseconds
    pub poll_timeout_ms: u64,
    /// Probe error handling during convergence
    pub poll_error_policy: ErrorPolicy,
    /// Time an automation may take, in milliseconds
    pub automation_budget_ms: u64,
    /// Interval between cancellation checks while a step waits, in milliseconds
    pub cancel_check_interval_ms: u64,
    /// What a restart re-runs
    pub restart_strategy: RestartStrategy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            test_timeout_ms: DEFAULT_TEST_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            poll_error_policy: ErrorPolicy::default(),
            automation_budget_ms: DEFAULT_AUTOMATION_BUDGET_MS,
            cancel_check_interval_ms: DEFAULT_CANCEL_CHECK_INTERVAL_MS,
            restart_strategy: RestartStrategy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Create default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set restart budget
    #[must_use]
    pub const fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Set per-test deadline
    #[must_use]
    pub const fn with_test_timeout(mut self, ms: u64) -> Self {
        self.test_timeout_ms = ms;
        self
    }

    /// Set convergence poll interval
    #[must_use]
    pub const fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set convergence poll deadline
    #[must_use]
    pub const fn with_poll_timeout(mut self, ms: u64) -> Self {
        self.poll_timeout_ms = ms;
        self
    }

    /// Set automation budget
    #[must_use]
    pub const fn with_automation_budget(mut self, ms: u64) -> Self {
        self.automation_budget_ms = ms;
        self
    }

    /// Set cancellation check interval
    #[must_use]
    pub const fn with_cancel_check_interval(mut self, ms: u64) -> Self {
        self.cancel_check_interval_ms = ms;
        self
    }

    /// Set restart strategy
    #[must_use]
    pub const fn with_restart_strategy(mut self, strategy: RestartStrategy) -> Self {
        self.restart_strategy = strategy;
        self
    }

    /// Per-test deadline
    #[must_use]
    pub const fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    /// Automation budget
    #[must_use]
    pub const fn automation_budget(&self) -> Duration {
        Duration::from_millis(self.automation_budget_ms)
    }

    /// Cancellation check interval
    #[must_use]
    pub const fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms)
    }

    /// Poll options for mutation convergence
    #[must_use]
    pub const fn poll_options(&self) -> PollOptions {
        PollOptions {
            timeout_ms: self.poll_timeout_ms,
            interval_ms: self.poll_interval_ms,
            error_policy: self.poll_error_policy,
        }
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> StagehandResult<()> {
        let positive = [
            ("test_timeout_ms", self.test_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("automation_budget_ms", self.automation_budget_ms),
            ("cancel_check_interval_ms", self.cancel_check_interval_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(StagehandError::config(format!("{name} must be greater than zero")));
        }
        if self.poll_interval_ms > self.poll_timeout_ms {
            return Err(StagehandError::config(format!(
                "poll_interval_ms ({}) exceeds poll_timeout_ms ({})",
                self.poll_interval_ms, self.poll_timeout_ms
            )));
        }
        Ok(())
    }

    /// Parse and validate YAML
    pub fn from_yaml(yaml: &str) -> StagehandResult<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml_ng::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> StagehandResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> StagehandResult<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }
}
