//! Device collaborators
//!
//! Stagehand never talks to a device directly. Commands go through a
//! [`CommandExecutor`] and reads through a [`StateObserver`]; both are
//! injected through [`DeviceServices`] when an orchestrator is built.

use crate::dimension::{Dimension, StateValue};
use crate::result::StagehandResult;
use std::fmt;
use std::sync::Arc;

/// Captured result of a device command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output and error, combined
    pub stdout: String,
    /// Process exit status
    pub exit_code: i32,
}

impl CommandOutput {
    /// Successful output
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: 0,
        }
    }

    /// Failed output
    pub fn failure(exit_code: i32, stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code,
        }
    }

    /// Whether the command exited with status zero
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands against the device under test
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args` and capture its output.
    ///
    /// A non-zero exit status is returned as output, not as an error;
    /// errors are reserved for failing to run the command at all.
    fn execute(&self, program: &str, args: &[String]) -> StagehandResult<CommandOutput>;
}

/// Reads the current value of a dimension from the device
pub trait StateObserver: Send + Sync {
    /// Current value of `dimension`
    fn observe(&self, dimension: &Dimension) -> StagehandResult<StateValue>;
}

/// Device-facing handles shared by resolvers, sessions and test bodies
#[derive(Clone)]
pub struct DeviceServices {
    executor: Arc<dyn CommandExecutor>,
    observer: Arc<dyn StateObserver>,
}

impl fmt::Debug for DeviceServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceServices").finish_non_exhaustive()
    }
}

impl DeviceServices {
    /// Combine a separate executor and observer
    #[must_use]
    pub fn new(executor: Arc<dyn CommandExecutor>, observer: Arc<dyn StateObserver>) -> Self {
        Self { executor, observer }
    }

    /// Use one device handle for both commands and observation
    #[must_use]
    pub fn from_device<D>(device: Arc<D>) -> Self
    where
        D: CommandExecutor + StateObserver + 'static,
    {
        Self {
            executor: device.clone(),
            observer: device,
        }
    }

    /// Command executor
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// State observer
    #[must_use]
    pub fn observer(&self) -> &Arc<dyn StateObserver> {
        &self.observer
    }

    /// Observe `dimension`
    pub fn observe(&self, dimension: &Dimension) -> StagehandResult<StateValue> {
        self.observer.observe(dimension)
    }

    /// Run a command
    pub fn execute(&self, program: &str, args: &[String]) -> StagehandResult<CommandOutput> {
        self.executor.execute(program, args)
    }
}
