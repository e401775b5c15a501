//! Command handlers

use crate::commands::{ConfigArgs, InputArgs, PlanArgs, RehearseArgs};
use crate::error::{CliError, CliResult};
use crate::output::Printer;
use serde::Serialize;
use stagehand::{
    BodyResult, DeviceServices, DeviceSnapshot, MutationState, Orchestrator, OrchestratorConfig,
    RequirementCatalog, SimulatedDevice, StagehandError, TestContext, TestOutcome, TestReport,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// How a command finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Everything passed
    Success,
    /// At least one test failed or leaked state
    Failed,
    /// Nothing failed but at least one test was skipped
    Skipped,
}

impl RunStatus {
    /// Process exit code
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::Skipped => 2,
        }
    }
}

fn read(path: &Path) -> CliResult<String> {
    std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse<T>(path: &Path, decode: impl FnOnce(&str) -> Result<T, StagehandError>) -> CliResult<T> {
    let text = read(path)?;
    decode(&text).map_err(|source| CliError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_inputs(input: &InputArgs) -> CliResult<(RequirementCatalog, DeviceSnapshot)> {
    let catalog = parse(&input.requirements, RequirementCatalog::from_yaml)?;
    let snapshot = match &input.snapshot {
        Some(path) => parse(path, DeviceSnapshot::from_yaml)?,
        None => DeviceSnapshot::default(),
    };
    debug!(
        tests = catalog.tests.len(),
        common = catalog.common.len(),
        values = snapshot.values.len(),
        "inputs loaded"
    );
    Ok((catalog, snapshot))
}

/// `stagehand plan`
pub fn run_plan(args: &PlanArgs, printer: &Printer) -> CliResult<RunStatus> {
    let (catalog, snapshot) = load_inputs(&args.input)?;
    let device = Arc::new(SimulatedDevice::from_snapshot(&snapshot));
    let orchestrator =
        Orchestrator::builder(DeviceServices::from_device(device), catalog).build()?;
    let plan = orchestrator.plan(&args.test)?;

    if args.input.json {
        #[derive(Serialize)]
        struct PlanOutput<'a> {
            test: &'a str,
            mutations: Vec<stagehand::MutationRecord>,
            notes: &'a [String],
        }
        let output = PlanOutput {
            test: &args.test,
            mutations: plan.records(),
            notes: plan.notes(),
        };
        printer.raw(&serde_json::to_string_pretty(&output)?)?;
    } else {
        printer.plan(&args.test, &plan)?;
    }
    Ok(RunStatus::Success)
}

/// Rehearsal body: every planned value must be observable on the device
fn verify_applied(ctx: &TestContext<'_>) -> BodyResult {
    for record in ctx.applied_mutations() {
        if matches!(record.state, MutationState::Applied | MutationState::NoOp) {
            ctx.wait_for(&record.dimension, record.target.clone())?;
        }
    }
    Ok(())
}

/// Result of rehearsing one test
#[derive(Debug, Clone, Serialize)]
pub struct Rehearsal {
    /// Orchestrator report
    pub report: TestReport,
    /// Dimensions whose value differed from the snapshot after teardown
    pub leaked: Vec<String>,
}

impl Rehearsal {
    /// Whether the test passed and left the device as it found it
    #[must_use]
    pub fn is_clean_pass(&self) -> bool {
        self.report.outcome.is_passed() && self.leaked.is_empty()
    }
}

fn leaked_dimensions(before: &DeviceSnapshot, after: &DeviceSnapshot) -> Vec<String> {
    let missing = before.values.iter().filter(|entry| !after.values.contains(entry));
    let added = after.values.iter().filter(|entry| !before.values.contains(entry));
    let changed: BTreeSet<String> = missing
        .chain(added)
        .map(|entry| entry.dimension.to_string())
        .collect();
    changed.into_iter().collect()
}

/// Rehearse `test` on a fresh simulated device built from `snapshot`
pub fn rehearse_one(
    catalog: &RequirementCatalog,
    snapshot: &DeviceSnapshot,
    config: &OrchestratorConfig,
    test: &str,
) -> CliResult<Rehearsal> {
    let device = Arc::new(SimulatedDevice::from_snapshot(snapshot));
    let before = device.snapshot();
    let mut orchestrator =
        Orchestrator::builder(DeviceServices::from_device(device.clone()), catalog.clone())
            .config(config.clone())
            .build()?;
    let report = orchestrator.run(test, verify_applied);
    let leaked = leaked_dimensions(&before, &device.snapshot());
    info!(test, summary = %report.summary(), leaked = leaked.len(), "rehearsal finished");
    Ok(Rehearsal { report, leaked })
}

/// `stagehand rehearse`
pub fn run_rehearse(args: &RehearseArgs, printer: &Printer) -> CliResult<RunStatus> {
    let (catalog, snapshot) = load_inputs(&args.input)?;
    let config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };
    let tests: Vec<String> = match &args.test {
        Some(test) => vec![test.clone()],
        None => {
            let mut names: Vec<String> = catalog.tests.keys().cloned().collect();
            names.sort();
            names
        }
    };
    if tests.is_empty() {
        return Err(CliError::invalid_argument(format!(
            "{} declares no tests",
            args.input.requirements.display()
        )));
    }

    let mut rehearsals = Vec::with_capacity(tests.len());
    for test in &tests {
        let rehearsal = rehearse_one(&catalog, &snapshot, &config, test)?;
        if !args.input.json {
            printer.rehearsal(&rehearsal.report, &rehearsal.leaked)?;
        }
        rehearsals.push(rehearsal);
    }

    let failed = rehearsals
        .iter()
        .filter(|r| r.report.outcome.is_failed() || !r.leaked.is_empty())
        .count();
    let skipped = rehearsals
        .iter()
        .filter(|r| matches!(r.report.outcome, TestOutcome::Skipped { .. }) && r.leaked.is_empty())
        .count();
    let passed = rehearsals.iter().filter(|r| r.is_clean_pass()).count();

    if args.input.json {
        printer.raw(&serde_json::to_string_pretty(&rehearsals)?)?;
    } else {
        printer.tally(passed, failed, skipped)?;
    }

    Ok(if failed > 0 {
        RunStatus::Failed
    } else if skipped > 0 {
        RunStatus::Skipped
    } else {
        RunStatus::Success
    })
}

/// `stagehand config`
pub fn run_config(args: &ConfigArgs, printer: &Printer) -> CliResult<RunStatus> {
    let config = match &args.file {
        Some(path) => {
            let config = parse(path, OrchestratorConfig::from_yaml)?;
            info!(path = %path.display(), "configuration is valid");
            config
        }
        None => OrchestratorConfig::default(),
    };
    printer.raw(&config.to_yaml()?)?;
    Ok(RunStatus::Success)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use stagehand::{Dimension, Requirement, StateValue};

    fn fast() -> OrchestratorConfig {
        OrchestratorConfig::new()
            .with_poll_interval(1)
            .with_poll_timeout(100)
    }

    #[test]
    fn test_rehearsal_restores_snapshot() {
        let catalog = RequirementCatalog::new()
            .with_requirement("radio", Requirement::must(Dimension::Wifi, true))
            .with_requirement("radio", Requirement::must(Dimension::Bluetooth, false));
        let snapshot = SimulatedDevice::new()
            .with_value(Dimension::Bluetooth, StateValue::Bool(true))
            .snapshot();
        let rehearsal = rehearse_one(&catalog, &snapshot, &fast(), "radio").unwrap();
        assert!(rehearsal.is_clean_pass(), "{}", rehearsal.report.summary());
        assert_eq!(rehearsal.report.attempts[0].mutations.len(), 2);
    }

    #[test]
    fn test_leaked_dimensions() {
        let before = SimulatedDevice::new()
            .with_value(Dimension::Wifi, StateValue::Bool(true))
            .snapshot();
        let after = SimulatedDevice::new()
            .with_value(Dimension::global_setting("locale"), StateValue::text("fr"))
            .snapshot();
        assert_eq!(
            leaked_dimensions(&before, &after),
            vec!["setting[locale]".to_string(), "wifi".to_string()]
        );
        assert!(leaked_dimensions(&before, &before).is_empty());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
        assert_eq!(RunStatus::Skipped.exit_code(), 2);
    }
}
