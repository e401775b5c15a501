//! Stagehand CLI: plan and rehearse device-state requirements
//!
//! ## Usage
//!
//! ```bash
//! stagehand plan reqs.yaml --test enrolls_work_profile     # Ordered plan
//! stagehand rehearse reqs.yaml --snapshot device.yaml      # Apply, verify, restore
//! stagehand config stagehand.yaml                          # Validate configuration
//! ```

use clap::Parser;
use stagehand_cli::{
    configure_colors, logging, run_config, run_plan, run_rehearse, Cli, CliResult, Commands,
    Printer, RunStatus,
};
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(status) => ExitCode::from(status.exit_code()),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> CliResult<RunStatus> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet, cli.log_format);
    configure_colors(cli.color);
    let printer = Printer::new(cli.quiet);

    match &cli.command {
        Commands::Plan(args) => run_plan(args, &printer),
        Commands::Rehearse(args) => run_rehearse(args, &printer),
        Commands::Config(args) => run_config(args, &printer),
    }
}
