//! Dimension drivers
//!
//! A driver knows the device commands that move one category of dimension
//! from its current value to a target value. Drivers are looked up by
//! [`DimensionCategory`] in a [`DriverTable`]; read-only categories have no
//! driver.

use crate::device::DeviceServices;
use crate::dimension::{Dimension, DimensionCategory, StateValue};
use crate::result::{StagehandError, StagehandResult};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Output of `pm` and `dpm` commands that completed
#[allow(clippy::expect_used)]
static SUCCESS_OUTPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^Success").expect("success pattern is valid"));

// =============================================================================
// COMMANDS
// =============================================================================

/// A device command with an optional expected-output pattern
#[derive(Debug, Clone)]
pub struct DeviceCommand {
    /// Program to run
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Pattern the output must match for the command to count as successful
    pub expect: Option<Regex>,
}

impl DeviceCommand {
    /// Create a command
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            expect: None,
        }
    }

    /// Require the output to match `pattern`
    pub fn expecting(mut self, pattern: &str) -> StagehandResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| StagehandError::config(format!("invalid output pattern `{pattern}`: {e}")))?;
        self.expect = Some(regex);
        Ok(self)
    }

    /// Require the output to match an already compiled `pattern`
    #[must_use]
    pub fn expecting_match(mut self, pattern: &Regex) -> Self {
        self.expect = Some(pattern.clone());
        self
    }

    /// Command line as a single string
    #[must_use]
    pub fn render(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Run the command, checking exit status and expected output
    pub fn run(&self, services: &DeviceServices) -> StagehandResult<String> {
        let output = services.execute(&self.program, &self.args)?;
        debug!(command = %self.render(), exit_code = output.exit_code, "device command finished");
        if !output.is_success() {
            return Err(StagehandError::Command {
                command: self.render(),
                status: output.exit_code,
                output: output.stdout,
            });
        }
        if let Some(pattern) = &self.expect {
            if !pattern.is_match(&output.stdout) {
                return Err(StagehandError::UnexpectedOutput {
                    command: self.render(),
                    pattern: pattern.as_str().to_string(),
                    output: output.stdout,
                });
            }
        }
        Ok(output.stdout)
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Run `commands` in order, stopping at the first failure
pub fn run_commands(services: &DeviceServices, commands: &[DeviceCommand]) -> StagehandResult<()> {
    for command in commands {
        command.run(services)?;
    }
    Ok(())
}

// =============================================================================
// DRIVER TRAIT
// =============================================================================

/// Encodes the commands that change one category of dimension
pub trait DimensionDriver: Send + Sync {
    /// Commands that move `dimension` from `current` to `target`
    fn commands(
        &self,
        dimension: &Dimension,
        current: &StateValue,
        target: &StateValue,
    ) -> StagehandResult<Vec<DeviceCommand>>;
}

fn unsupported(dimension: &Dimension, target: &StateValue) -> StagehandError {
    StagehandError::invalid_state(format!("{dimension} cannot be set to {target}"))
}

fn wrong_driver(dimension: &Dimension) -> StagehandError {
    StagehandError::invalid_state(format!("driver does not handle {dimension}"))
}

fn scalar_arg(dimension: &Dimension, value: &StateValue) -> StagehandResult<String> {
    match value {
        StateValue::Bool(v) => Ok(v.to_string()),
        StateValue::Int(v) => Ok(v.to_string()),
        StateValue::Text(v) => Ok(v.clone()),
        other => Err(unsupported(dimension, other)),
    }
}

fn flag_arg(dimension: &Dimension, value: &StateValue) -> StagehandResult<&'static str> {
    match value {
        StateValue::Bool(true) => Ok("1"),
        StateValue::Bool(false) => Ok("0"),
        other => Err(unsupported(dimension, other)),
    }
}

// =============================================================================
// STANDARD DRIVERS
// =============================================================================

/// Creates and removes users
#[derive(Debug, Clone, Copy, Default)]
pub struct UserDriver;

impl DimensionDriver for UserDriver {
    fn commands(
        &self,
        dimension: &Dimension,
        _current: &StateValue,
        target: &StateValue,
    ) -> StagehandResult<Vec<DeviceCommand>> {
        match (dimension, target) {
            (Dimension::UserPresent { user_type }, StateValue::Bool(true)) => Ok(vec![
                DeviceCommand::new("pm", ["create-user", "--user-type", user_type.as_str()])
                    .expecting_match(&SUCCESS_OUTPUT),
            ]),
            (Dimension::UserPresent { user_type }, StateValue::Bool(false)) => Ok(vec![
                DeviceCommand::new("pm", ["remove-user", "--user-type", user_type.as_str()])
                    .expecting_match(&SUCCESS_OUTPUT),
            ]),
            (Dimension::CurrentUser, StateValue::Text(user_type)) => Ok(vec![DeviceCommand::new(
                "am",
                ["switch-user", "--user-type", user_type.as_str()],
            )]),
            (Dimension::UserPresent { .. } | Dimension::CurrentUser, other) => {
                Err(unsupported(dimension, other))
            }
            _ => Err(wrong_driver(dimension)),
        }
    }
}

/// Installs and removes device and profile owners
#[derive(Debug, Clone, Copy, Default)]
pub struct AdminDriver;

impl AdminDriver {
    fn remove(dimension: &Dimension, current: &StateValue) -> Option<DeviceCommand> {
        let StateValue::Text(component) = current else {
            return None;
        };
        Some(match dimension {
            Dimension::ProfileOwner { user_type } => DeviceCommand::new(
                "dpm",
                [
                    "remove-active-admin",
                    "--user-type",
                    user_type.as_str(),
                    component.as_str(),
                ],
            ),
            _ => DeviceCommand::new("dpm", ["remove-active-admin", component.as_str()]),
        })
    }
}

impl DimensionDriver for AdminDriver {
    fn commands(
        &self,
        dimension: &Dimension,
        current: &StateValue,
        target: &StateValue,
    ) -> StagehandResult<Vec<DeviceCommand>> {
        let mut commands: Vec<DeviceCommand> = Self::remove(dimension, current).into_iter().collect();
        match (dimension, target) {
            (Dimension::DeviceOwner, StateValue::Text(component)) => {
                commands.push(
                    DeviceCommand::new("dpm", ["set-device-owner", component.as_str()])
                        .expecting_match(&SUCCESS_OUTPUT),
                );
            }
            (Dimension::ProfileOwner { user_type }, StateValue::Text(component)) => {
                commands.push(
                    DeviceCommand::new(
                        "dpm",
                        [
                            "set-profile-owner",
                            "--user-type",
                            user_type.as_str(),
                            component.as_str(),
                        ],
                    )
                    .expecting_match(&SUCCESS_OUTPUT),
                );
            }
            (Dimension::DeviceOwner | Dimension::ProfileOwner { .. }, StateValue::Absent) => {}
            (Dimension::DeviceOwner | Dimension::ProfileOwner { .. }, other) => {
                return Err(unsupported(dimension, other));
            }
            _ => return Err(wrong_driver(dimension)),
        }
        Ok(commands)
    }
}

/// Grants and revokes runtime permissions
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionDriver;

impl DimensionDriver for PermissionDriver {
    fn commands(
        &self,
        dimension: &Dimension,
        _current: &StateValue,
        target: &StateValue,
    ) -> StagehandResult<Vec<DeviceCommand>> {
        let Dimension::PermissionGranted {
            package,
            permission,
        } = dimension
        else {
            return Err(wrong_driver(dimension));
        };
        let verb = match target {
            StateValue::Bool(true) => "grant",
            StateValue::Bool(false) => "revoke",
            other => return Err(unsupported(dimension, other)),
        };
        Ok(vec![DeviceCommand::new(
            "pm",
            [verb, package.as_str(), permission.as_str()],
        )])
    }
}

/// Sets and clears device policies
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyDriver;

impl DimensionDriver for PolicyDriver {
    fn commands(
        &self,
        dimension: &Dimension,
        _current: &StateValue,
        target: &StateValue,
    ) -> StagehandResult<Vec<DeviceCommand>> {
        let Dimension::Policy { name } = dimension else {
            return Err(wrong_driver(dimension));
        };
        let command = match target {
            StateValue::Absent => {
                DeviceCommand::new("cmd", ["device_policy", "clear-policy", name.as_str()])
            }
            StateValue::Set(args) => {
                let joined = args.iter().map(String::as_str).collect::<Vec<_>>().join(",");
                DeviceCommand::new(
                    "cmd",
                    ["device_policy", "set-policy", name.as_str(), joined.as_str()],
                )
            }
            other => return Err(unsupported(dimension, other)),
        };
        Ok(vec![command])
    }
}

/// Sets user restrictions
#[derive(Debug, Clone, Copy, Default)]
pub struct RestrictionDriver;

impl DimensionDriver for RestrictionDriver {
    fn commands(
        &self,
        dimension: &Dimension,
        _current: &StateValue,
        target: &StateValue,
    ) -> StagehandResult<Vec<DeviceCommand>> {
        let Dimension::UserRestriction {
            user_type,
            restriction,
        } = dimension
        else {
            return Err(wrong_driver(dimension));
        };
        Ok(vec![DeviceCommand::new(
            "pm",
            [
                "set-user-restriction",
                "--user-type",
                user_type.as_str(),
                restriction.as_str(),
                flag_arg(dimension, target)?,
            ],
        )])
    }
}

/// Writes and deletes feature flags
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlagDriver;

impl DimensionDriver for FeatureFlagDriver {
    fn commands(
        &self,
        dimension: &Dimension,
        _current: &StateValue,
        target: &StateValue,
    ) -> StagehandResult<Vec<DeviceCommand>> {
        let Dimension::FeatureFlag { namespace, key } = dimension else {
            return Err(wrong_driver(dimension));
        };
        let command = if target.is_absent() {
            DeviceCommand::new("device_config", ["delete", namespace.as_str(), key.as_str()])
        } else {
            let value = scalar_arg(dimension, target)?;
            DeviceCommand::new(
                "device_config",
                ["put", namespace.as_str(), key.as_str(), value.as_str()],
            )
        };
        Ok(vec![command])
    }
}

/// Writes and deletes global settings
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingDriver;

impl DimensionDriver for SettingDriver {
    fn commands(
        &self,
        dimension: &Dimension,
        _current: &StateValue,
        target: &StateValue,
    ) -> StagehandResult<Vec<DeviceCommand>> {
        let Dimension::GlobalSetting { key } = dimension else {
            return Err(wrong_driver(dimension));
        };
        let command = if target.is_absent() {
            DeviceCommand::new("settings", ["delete", "global", key.as_str()])
        } else {
            let value = scalar_arg(dimension, target)?;
            DeviceCommand::new("settings", ["put", "global", key.as_str(), value.as_str()])
        };
        Ok(vec![command])
    }
}

/// Toggles radios
#[derive(Debug, Clone, Copy, Default)]
pub struct RadioDriver;

impl DimensionDriver for RadioDriver {
    fn commands(
        &self,
        dimension: &Dimension,
        _current: &StateValue,
        target: &StateValue,
    ) -> StagehandResult<Vec<DeviceCommand>> {
        let service = match dimension {
            Dimension::Wifi => "wifi",
            Dimension::Bluetooth => "bluetooth",
            _ => return Err(wrong_driver(dimension)),
        };
        let action = match target {
            StateValue::Bool(true) => "enable",
            StateValue::Bool(false) => "disable",
            other => return Err(unsupported(dimension, other)),
        };
        Ok(vec![DeviceCommand::new("svc", [service, action])])
    }
}

// =============================================================================
// DRIVER TABLE
// =============================================================================

/// Lookup table from category to driver
#[derive(Clone, Default)]
pub struct DriverTable {
    drivers: HashMap<DimensionCategory, Arc<dyn DimensionDriver>>,
}

impl fmt::Debug for DriverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut categories: Vec<_> = self.drivers.keys().collect();
        categories.sort();
        f.debug_struct("DriverTable")
            .field("categories", &categories)
            .finish()
    }
}

impl DriverTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with a driver for every mutable category
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with_driver(DimensionCategory::User, UserDriver)
            .with_driver(DimensionCategory::UserSwitch, UserDriver)
            .with_driver(DimensionCategory::Admin, AdminDriver)
            .with_driver(DimensionCategory::Permission, PermissionDriver)
            .with_driver(DimensionCategory::Policy, PolicyDriver)
            .with_driver(DimensionCategory::Restriction, RestrictionDriver)
            .with_driver(DimensionCategory::FeatureFlag, FeatureFlagDriver)
            .with_driver(DimensionCategory::Setting, SettingDriver)
            .with_driver(DimensionCategory::Radio, RadioDriver)
    }

    /// Register (or replace) the driver for `category`
    #[must_use]
    pub fn with_driver<D>(mut self, category: DimensionCategory, driver: D) -> Self
    where
        D: DimensionDriver + 'static,
    {
        self.register(category, Arc::new(driver));
        self
    }

    /// Register (or replace) the driver for `category`
    pub fn register(&mut self, category: DimensionCategory, driver: Arc<dyn DimensionDriver>) {
        self.drivers.insert(category, driver);
    }

    /// Driver for the category of `dimension`
    #[must_use]
    pub fn driver_for(&self, dimension: &Dimension) -> Option<Arc<dyn DimensionDriver>> {
        self.drivers.get(&dimension.category()).cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn render(commands: &[DeviceCommand]) -> Vec<String> {
        commands.iter().map(DeviceCommand::render).collect()
    }

    #[test]
    fn test_radio_commands() {
        let cmds = RadioDriver
            .commands(&Dimension::Wifi, &StateValue::Bool(false), &StateValue::Bool(true))
            .unwrap();
        assert_eq!(render(&cmds), ["svc wifi enable"]);
        assert!(RadioDriver
            .commands(&Dimension::Wifi, &StateValue::Absent, &StateValue::text("on"))
            .is_err());
    }

    #[test]
    fn test_device_owner_replaces_existing() {
        let cmds = AdminDriver
            .commands(
                &Dimension::DeviceOwner,
                &StateValue::text("com.old/.Admin"),
                &StateValue::text("com.new/.Admin"),
            )
            .unwrap();
        assert_eq!(
            render(&cmds),
            [
                "dpm remove-active-admin com.old/.Admin",
                "dpm set-device-owner com.new/.Admin"
            ]
        );
        assert!(cmds[1].expect.is_some());
    }

    #[test]
    fn test_clearing_device_owner_removes_only() {
        let cmds = AdminDriver
            .commands(
                &Dimension::DeviceOwner,
                &StateValue::text("com.old/.Admin"),
                &StateValue::Absent,
            )
            .unwrap();
        assert_eq!(render(&cmds), ["dpm remove-active-admin com.old/.Admin"]);
    }

    #[test]
    fn test_policy_set_joins_arguments() {
        let cmds = PolicyDriver
            .commands(
                &Dimension::policy("camera_disabled"),
                &StateValue::Absent,
                &StateValue::set(["work", "personal"]),
            )
            .unwrap();
        assert_eq!(
            render(&cmds),
            ["cmd device_policy set-policy camera_disabled personal,work"]
        );
    }

    #[test]
    fn test_flag_delete_when_absent() {
        let cmds = FeatureFlagDriver
            .commands(
                &Dimension::feature_flag("ui", "dark"),
                &StateValue::Bool(true),
                &StateValue::Absent,
            )
            .unwrap();
        assert_eq!(render(&cmds), ["device_config delete ui dark"]);
    }

    #[test]
    fn test_wrong_driver_rejected() {
        assert!(SettingDriver
            .commands(&Dimension::Wifi, &StateValue::Absent, &StateValue::Bool(true))
            .is_err());
    }

    #[test]
    fn test_standard_table_has_no_precondition_driver() {
        let table = DriverTable::standard();
        assert!(table.driver_for(&Dimension::system_feature("nfc")).is_none());
        assert!(table.driver_for(&Dimension::CurrentUser).is_some());
        assert!(table.driver_for(&Dimension::Bluetooth).is_some());
    }

    #[test]
    fn test_success_pattern_is_compiled_once() {
        let create = UserDriver
            .commands(&Dimension::user("secondary"), &StateValue::Bool(false), &StateValue::Bool(true))
            .unwrap();
        let remove = UserDriver
            .commands(&Dimension::user("secondary"), &StateValue::Bool(true), &StateValue::Bool(false))
            .unwrap();
        let first = create[0].expect.as_ref().unwrap();
        let second = remove[0].expect.as_ref().unwrap();
        assert_eq!(first.as_str(), "^Success");
        assert!(std::ptr::eq(first.as_str(), second.as_str()));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = DeviceCommand::new("true", Vec::<String>::new())
            .expecting("(")
            .unwrap_err();
        assert!(matches!(err, StagehandError::Config { .. }));
    }
}
