//! Simulated device
//!
//! An in-memory device that understands the command vocabulary of the
//! standard drivers. Used by the unit tests, by downstream test suites, and
//! by `stagehand rehearse` to dry-run a requirement file against a snapshot
//! of real device state.
//!
//! Only values that differ from a dimension's default are stored, so a
//! device that has been fully restored has an empty [`DeviceSnapshot`].

use crate::device::{CommandExecutor, CommandOutput, StateObserver};
use crate::dimension::{Dimension, StateValue};
use crate::result::{StagehandError, StagehandResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Exit status for a command the simulator does not recognise
pub const UNKNOWN_COMMAND_EXIT: i32 = 127;

/// One stored value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Dimension
    pub dimension: Dimension,
    /// Value held
    pub value: StateValue,
}

/// Non-default device state, sorted by dimension
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Stored values
    #[serde(default)]
    pub values: Vec<SnapshotEntry>,
}

impl DeviceSnapshot {
    /// Parse a snapshot from YAML
    pub fn from_yaml(yaml: &str) -> StagehandResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> StagehandResult<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }
}

#[derive(Debug)]
struct Lagging {
    stale: StateValue,
    remaining: u32,
}

#[derive(Debug, Default)]
struct SimState {
    values: BTreeMap<Dimension, StateValue>,
    lagging: HashMap<Dimension, Lagging>,
    convergence_lag: u32,
    command_log: Vec<String>,
    fail_next: Vec<String>,
    observe_faults: HashMap<Dimension, u32>,
    observations: usize,
}

impl SimState {
    fn current(&self, dimension: &Dimension) -> StateValue {
        self.values
            .get(dimension)
            .cloned()
            .unwrap_or_else(|| dimension.default_value())
    }

    fn store(&mut self, dimension: Dimension, value: StateValue) {
        if value == dimension.default_value() {
            self.values.remove(&dimension);
        } else {
            self.values.insert(dimension, value);
        }
    }

    /// Store a value written by a command; observers see the old one for a while
    fn write(&mut self, dimension: Dimension, value: StateValue) {
        if self.convergence_lag > 0 {
            let stale = self.current(&dimension);
            self.lagging.insert(
                dimension.clone(),
                Lagging {
                    stale,
                    remaining: self.convergence_lag,
                },
            );
        }
        self.store(dimension, value);
    }
}

/// In-memory device
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    /// Device with every dimension at its default
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device holding the values in `snapshot`
    #[must_use]
    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Self {
        let device = Self::new();
        for entry in &snapshot.values {
            device.set_value(entry.dimension.clone(), entry.value.clone());
        }
        device
    }

    /// Builder form of [`set_value`](Self::set_value)
    #[must_use]
    pub fn with_value(self, dimension: Dimension, value: StateValue) -> Self {
        self.set_value(dimension, value);
        self
    }

    /// After a command changes a dimension, the next `observations` reads of
    /// it still return the previous value
    #[must_use]
    pub fn with_convergence_lag(self, observations: u32) -> Self {
        self.lock().convergence_lag = observations;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change a value directly, as if something outside the test did it
    pub fn set_value(&self, dimension: Dimension, value: StateValue) {
        let mut state = self.lock();
        state.lagging.remove(&dimension);
        state.store(dimension, value);
    }

    /// Stored value, ignoring convergence lag and faults
    #[must_use]
    pub fn value(&self, dimension: &Dimension) -> StateValue {
        self.lock().current(dimension)
    }

    /// Non-default values
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            values: self
                .lock()
                .values
                .iter()
                .map(|(dimension, value)| SnapshotEntry {
                    dimension: dimension.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    /// Commands executed so far, rendered as `program arg...`
    #[must_use]
    pub fn command_log(&self) -> Vec<String> {
        self.lock().command_log.clone()
    }

    /// Forget logged commands
    pub fn clear_command_log(&self) {
        self.lock().command_log.clear();
    }

    /// Fail the next command whose rendering contains `fragment` with exit status 1
    pub fn fail_next(&self, fragment: impl Into<String>) {
        self.lock().fail_next.push(fragment.into());
    }

    /// Fail the next `times` observations of `dimension`
    pub fn fail_observations(&self, dimension: Dimension, times: u32) {
        self.lock().observe_faults.insert(dimension, times);
    }

    /// Number of observations made
    #[must_use]
    pub fn observation_count(&self) -> usize {
        self.lock().observations
    }
}

// =============================================================================
// COMMAND DECODING
// =============================================================================

fn ok(stdout: &str) -> StagehandResult<CommandOutput> {
    Ok(CommandOutput::success(stdout))
}

fn unknown(rendered: &str) -> StagehandResult<CommandOutput> {
    Ok(CommandOutput::failure(
        UNKNOWN_COMMAND_EXIT,
        format!("unknown command: {rendered}"),
    ))
}

fn flag(raw: &str) -> Option<bool> {
    match raw {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn dispatch(state: &mut SimState, program: &str, args: &[&str], rendered: &str) -> StagehandResult<CommandOutput> {
    match (program, args) {
        ("pm", ["create-user", "--user-type", user_type]) => {
            state.write(Dimension::user(*user_type), StateValue::Bool(true));
            ok(&format!("Success: created user of type {user_type}"))
        }
        ("pm", ["remove-user", "--user-type", user_type]) => {
            state.write(Dimension::user(*user_type), StateValue::Bool(false));
            ok("Success: removed user")
        }
        ("pm", [verb @ ("grant" | "revoke"), package, permission]) => {
            let dimension = Dimension::PermissionGranted {
                package: (*package).to_string(),
                permission: (*permission).to_string(),
            };
            state.write(dimension, StateValue::Bool(*verb == "grant"));
            ok("")
        }
        ("pm", ["set-user-restriction", "--user-type", user_type, restriction, value]) => {
            let Some(enabled) = flag(value) else {
                return Ok(CommandOutput::failure(1, format!("bad restriction value: {value}")));
            };
            let dimension = Dimension::UserRestriction {
                user_type: (*user_type).to_string(),
                restriction: (*restriction).to_string(),
            };
            state.write(dimension, StateValue::Bool(enabled));
            ok("")
        }
        ("am", ["switch-user", "--user-type", user_type]) => {
            state.write(Dimension::CurrentUser, StateValue::text(*user_type));
            ok("")
        }
        ("dpm", ["set-device-owner", component]) => {
            state.write(Dimension::DeviceOwner, StateValue::text(*component));
            ok(&format!("Success: Device owner set to {component}"))
        }
        ("dpm", ["set-profile-owner", "--user-type", user_type, component]) => {
            let dimension = Dimension::ProfileOwner {
                user_type: (*user_type).to_string(),
            };
            state.write(dimension, StateValue::text(*component));
            ok(&format!("Success: Profile owner set to {component}"))
        }
        ("dpm", ["remove-active-admin", rest @ ..]) => {
            let (dimension, component) = match rest {
                ["--user-type", user_type, component] => (
                    Dimension::ProfileOwner {
                        user_type: (*user_type).to_string(),
                    },
                    *component,
                ),
                [component] => (Dimension::DeviceOwner, *component),
                _ => return unknown(rendered),
            };
            if state.current(&dimension).as_text() != Some(component) {
                return Ok(CommandOutput::failure(
                    1,
                    format!("Error: {component} is not an active admin"),
                ));
            }
            state.write(dimension, StateValue::Absent);
            ok("Success: Admin removed")
        }
        ("cmd", ["device_policy", "set-policy", name, joined]) => {
            let values = joined.split(',').filter(|item| !item.is_empty());
            state.write(Dimension::policy(*name), StateValue::set(values));
            ok("")
        }
        ("cmd", ["device_policy", "clear-policy", name]) => {
            state.write(Dimension::policy(*name), StateValue::Absent);
            ok("")
        }
        ("device_config", ["put", namespace, key, value]) => {
            state.write(
                Dimension::feature_flag(*namespace, *key),
                StateValue::parse_scalar(value),
            );
            ok("")
        }
        ("device_config", ["delete", namespace, key]) => {
            state.write(Dimension::feature_flag(*namespace, *key), StateValue::Absent);
            ok("")
        }
        ("settings", ["put", "global", key, value]) => {
            state.write(Dimension::global_setting(*key), StateValue::parse_scalar(value));
            ok("")
        }
        ("settings", ["delete", "global", key]) => {
            state.write(Dimension::global_setting(*key), StateValue::Absent);
            ok("")
        }
        ("svc", [radio @ ("wifi" | "bluetooth"), action @ ("enable" | "disable")]) => {
            let dimension = if *radio == "wifi" {
                Dimension::Wifi
            } else {
                Dimension::Bluetooth
            };
            state.write(dimension, StateValue::Bool(*action == "enable"));
            ok("")
        }
        _ => unknown(rendered),
    }
}

impl CommandExecutor for SimulatedDevice {
    fn execute(&self, program: &str, args: &[String]) -> StagehandResult<CommandOutput> {
        let rendered = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let mut state = self.lock();
        state.command_log.push(rendered.clone());

        if let Some(index) = state
            .fail_next
            .iter()
            .position(|fragment| rendered.contains(fragment.as_str()))
        {
            state.fail_next.remove(index);
            debug!(command = %rendered, "injected command failure");
            return Ok(CommandOutput::failure(1, "Error: injected failure"));
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = dispatch(&mut state, program, &args, &rendered)?;
        debug!(command = %rendered, exit_code = output.exit_code, "simulated command");
        Ok(output)
    }
}

impl StateObserver for SimulatedDevice {
    fn observe(&self, dimension: &Dimension) -> StagehandResult<StateValue> {
        let mut state = self.lock();
        state.observations += 1;

        if let Some(remaining) = state.observe_faults.get_mut(dimension) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StagehandError::observe(dimension, "injected observation failure"));
            }
        }

        if let Some(lagging) = state.lagging.get_mut(dimension) {
            if lagging.remaining > 0 {
                lagging.remaining -= 1;
                return Ok(lagging.stale.clone());
            }
            state.lagging.remove(dimension);
        }
        Ok(state.current(dimension))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn run(device: &SimulatedDevice, line: &str) -> CommandOutput {
        let mut parts = line.split(' ');
        let program = parts.next().unwrap();
        let args: Vec<String> = parts.map(String::from).collect();
        device.execute(program, &args).unwrap()
    }

    #[test]
    fn test_commands_update_values() {
        let device = SimulatedDevice::new();
        assert!(run(&device, "pm create-user --user-type secondary")
            .stdout
            .starts_with("Success"));
        run(&device, "cmd device_policy set-policy camera_disabled b,a");
        run(&device, "settings put global adb_enabled 1");
        run(&device, "device_config put wifi scan_throttle off");

        assert_eq!(device.value(&Dimension::user("secondary")), StateValue::Bool(true));
        assert_eq!(
            device.value(&Dimension::policy("camera_disabled")),
            StateValue::set(["a", "b"])
        );
        assert_eq!(
            device.value(&Dimension::global_setting("adb_enabled")),
            StateValue::Int(1)
        );
        assert_eq!(
            device.value(&Dimension::feature_flag("wifi", "scan_throttle")),
            StateValue::text("off")
        );
        assert_eq!(device.snapshot().values.len(), 4);
    }

    #[test]
    fn test_defaults_are_not_stored() {
        let device = SimulatedDevice::new();
        run(&device, "svc wifi enable");
        run(&device, "svc wifi disable");
        assert!(device.snapshot().values.is_empty());
        assert_eq!(
            device.command_log(),
            vec!["svc wifi enable", "svc wifi disable"]
        );
    }

    #[test]
    fn test_remove_admin_requires_match() {
        let device = SimulatedDevice::new()
            .with_value(Dimension::DeviceOwner, StateValue::text("com.example/.Admin"));
        assert_eq!(run(&device, "dpm remove-active-admin com.other/.Admin").exit_code, 1);
        assert!(run(&device, "dpm remove-active-admin com.example/.Admin").is_success());
        assert_eq!(device.value(&Dimension::DeviceOwner), StateValue::Absent);
    }

    #[test]
    fn test_unknown_command_and_injected_failure() {
        let device = SimulatedDevice::new();
        assert_eq!(run(&device, "reboot now").exit_code, UNKNOWN_COMMAND_EXIT);
        device.fail_next("svc bluetooth");
        assert_eq!(run(&device, "svc bluetooth enable").exit_code, 1);
        assert!(run(&device, "svc bluetooth enable").is_success());
        assert_eq!(device.value(&Dimension::Bluetooth), StateValue::Bool(true));
    }

    #[test]
    fn test_convergence_lag_and_observe_faults() {
        let device = SimulatedDevice::new().with_convergence_lag(2);
        run(&device, "svc wifi enable");
        assert_eq!(device.observe(&Dimension::Wifi).unwrap(), StateValue::Bool(false));
        assert_eq!(device.observe(&Dimension::Wifi).unwrap(), StateValue::Bool(false));
        assert_eq!(device.observe(&Dimension::Wifi).unwrap(), StateValue::Bool(true));

        device.fail_observations(Dimension::Bluetooth, 1);
        assert!(device.observe(&Dimension::Bluetooth).is_err());
        assert!(device.observe(&Dimension::Bluetooth).is_ok());
        assert_eq!(device.observation_count(), 5);
    }

    #[test]
    fn test_snapshot_yaml_round_trip() {
        let yaml = "values:\n  - dimension: {kind: wifi}\n    value: true\n  - dimension: {kind: global_setting, key: locale}\n    value: fr\n";
        let snapshot = DeviceSnapshot::from_yaml(yaml).unwrap();
        let device = SimulatedDevice::from_snapshot(&snapshot);
        assert_eq!(device.value(&Dimension::Wifi), StateValue::Bool(true));
        assert_eq!(
            device.value(&Dimension::global_setting("locale")),
            StateValue::text("fr")
        );
        let back = DeviceSnapshot::from_yaml(&device.snapshot().to_yaml().unwrap()).unwrap();
        assert_eq!(back, device.snapshot());
    }
}
