//! Stagehand: declarative device-state orchestration for integration tests
//!
//! Tests declare the device state they need (users, owners, permissions,
//! policies, flags, settings, radios). Stagehand resolves those declarations
//! into an ordered plan, applies it, runs the test body, and restores every
//! change afterwards, restarting the test from a clean slate when the body
//! asks for it. Bodies can hand control to a human tester through
//! interactive steps, which are answered by automation where one is bound.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    STAGEHAND Architecture                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   ┌────────────┐    ┌────────────┐    ┌────────────┐            │
//! │   │Requirement │    │ Resolver   │    │ State      │            │
//! │   │ Source     │───►│ (plan)     │───►│ Session    │──► device  │
//! │   └────────────┘    └────────────┘    └────────────┘            │
//! │          ▲                                  │ undo stack        │
//! │   ┌────────────┐    ┌────────────┐          ▼                   │
//! │   │Orchestrator│───►│ Test body  │───►┌────────────┐            │
//! │   │ (attempts) │    │            │    │ Step       │──► surface │
//! │   └────────────┘    └────────────┘    │ Engine     │            │
//! │                                       └────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stagehand::{
//!     DeviceServices, Dimension, Orchestrator, Requirement, RequirementCatalog, SimulatedDevice,
//! };
//!
//! let device = Arc::new(SimulatedDevice::new());
//! let catalog = RequirementCatalog::new()
//!     .with_requirement("scans_networks", Requirement::must(Dimension::Wifi, true));
//! let mut orchestrator = Orchestrator::builder(DeviceServices::from_device(device), catalog)
//!     .build()?;
//! let report = orchestrator.run("scans_networks", |ctx| {
//!     ctx.wait_for(&Dimension::Wifi, true.into())?;
//!     Ok(())
//! });
//! assert!(report.outcome.is_passed());
//! # Ok::<(), stagehand::StagehandError>(())
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::large_stack_frames))]

mod automation;
mod cancel;
mod config;
mod device;
mod dimension;
/// Drivers that translate dimension changes into device commands
#[allow(clippy::missing_errors_doc, clippy::must_use_candidate)]
pub mod driver;
mod engine;
mod mutation;
mod orchestrator;
mod poll;
mod report;
mod requirement;
mod resolver;
mod result;
mod session;
/// In-memory device for tests and rehearsals
#[allow(clippy::missing_errors_doc)]
pub mod sim;
mod step;
mod surface;

/// Test doubles for presentation surfaces and listeners
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use automation::{Automation, AutomationRegistry};
pub use cancel::{CancelReason, CancelToken};
pub use config::{
    OrchestratorConfig, RestartStrategy, DEFAULT_MAX_RESTARTS, DEFAULT_TEST_TIMEOUT_MS,
};
pub use device::{CommandExecutor, CommandOutput, DeviceServices, StateObserver};
pub use dimension::{Dimension, DimensionCategory, StateValue};
pub use driver::{DeviceCommand, DimensionDriver, DriverTable};
pub use engine::{StepEngine, DEFAULT_AUTOMATION_BUDGET_MS, DEFAULT_CANCEL_CHECK_INTERVAL_MS};
pub use mutation::{Mutation, MutationRecord, MutationState};
pub use orchestrator::{
    BodyError, BodyResult, LifecycleListener, Orchestrator, OrchestratorBuilder, RunControl,
    TestContext,
};
pub use poll::{
    poll_until, ErrorPolicy, Poll, PollOptions, DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_TIMEOUT_MS,
    DEFAULT_TOLERATED_ERRORS,
};
pub use report::{AttemptRecord, AttemptResult, Diagnostic, FailureRecord, TestOutcome, TestReport};
pub use requirement::{FailureMode, Requirement, RequirementCatalog, RequirementSource, Strength};
pub use resolver::{ResolvedPlan, Resolver};
pub use result::{Phase, StagehandError, StagehandResult, UndoFailure};
pub use session::StateSession;
pub use sim::{DeviceSnapshot, SimulatedDevice};
pub use step::{
    Affordance, HumanResponse, ResolvedBy, Step, StepFailure, StepId, StepRecord, StepResolution,
    StepSpec, StepState, Verdict,
};
pub use surface::{PresentationSurface, Responder, StepPrompt, UnattendedSurface};
