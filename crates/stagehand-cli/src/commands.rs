//! CLI command definitions using clap

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Stagehand: plan and rehearse declarative device-state requirements
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Color output (auto, always, never)
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorArg,

    /// Log format on stderr
    #[arg(long, default_value = "text", global = true, env = "STAGEHAND_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve a test's requirements into an ordered plan without applying it
    Plan(PlanArgs),

    /// Apply, verify and restore requirements against a simulated device
    Rehearse(RehearseArgs),

    /// Show or validate orchestrator configuration
    Config(ConfigArgs),
}

/// Requirement and device inputs shared by `plan` and `rehearse`
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Requirement catalog (YAML)
    pub requirements: PathBuf,

    /// Device snapshot to start from (YAML); defaults to a device with every dimension at its default
    #[arg(short, long)]
    pub snapshot: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `plan`
#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Inputs
    #[command(flatten)]
    pub input: InputArgs,

    /// Test whose requirements to resolve
    #[arg(short, long)]
    pub test: String,
}

/// Arguments for `rehearse`
#[derive(Args, Debug, Clone)]
pub struct RehearseArgs {
    /// Inputs
    #[command(flatten)]
    pub input: InputArgs,

    /// Rehearse one test instead of every test in the catalog
    #[arg(short, long)]
    pub test: Option<String>,

    /// Orchestrator configuration (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Arguments for `config`
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Configuration file to validate; prints the defaults when omitted
    pub file: Option<PathBuf>,
}

/// Color argument for CLI
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorArg {
    /// Automatic color detection
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}
