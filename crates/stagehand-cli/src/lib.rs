//! Stagehand CLI library
//!
//! Command-line front end for planning and rehearsing requirement catalogs
//! against a simulated device.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod commands;
mod error;
pub mod handlers;
pub mod logging;
mod output;

pub use commands::{
    Cli, ColorArg, Commands, ConfigArgs, InputArgs, LogFormat, PlanArgs, RehearseArgs,
};
pub use error::{CliError, CliResult};
pub use handlers::{rehearse_one, run_config, run_plan, run_rehearse, Rehearsal, RunStatus};
pub use output::{configure_colors, Printer};
