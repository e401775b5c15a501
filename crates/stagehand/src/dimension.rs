//! State dimensions and values
//!
//! A [`Dimension`] names one independently settable aspect of device state.
//! Each dimension belongs to a [`DimensionCategory`]; categories carry the
//! fixed priority used to order a resolved plan, so that users exist before
//! an owner is installed on them and policies apply before the settings
//! they constrain.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// =============================================================================
// DIMENSION
// =============================================================================

/// One independently settable (or readable) aspect of device state
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dimension {
    /// Hardware or software feature advertised by the device (read-only)
    SystemFeature {
        /// Feature name
        name: String,
    },
    /// A user of the given type exists
    UserPresent {
        /// User type, e.g. `secondary` or `work_profile`
        user_type: String,
    },
    /// Type of the user in the foreground
    CurrentUser,
    /// Installed device owner component
    DeviceOwner,
    /// Installed profile owner component for a user type
    ProfileOwner {
        /// User type the profile owner is installed on
        user_type: String,
    },
    /// Runtime permission grant for a package
    PermissionGranted {
        /// Package name
        package: String,
        /// Permission name
        permission: String,
    },
    /// Device policy arguments
    Policy {
        /// Policy name
        name: String,
    },
    /// User restriction for a user type
    UserRestriction {
        /// User type the restriction applies to
        user_type: String,
        /// Restriction key
        restriction: String,
    },
    /// Server-side feature flag
    FeatureFlag {
        /// Flag namespace
        namespace: String,
        /// Flag key
        key: String,
    },
    /// Global setting
    GlobalSetting {
        /// Setting key
        key: String,
    },
    /// Wi-Fi radio enabled
    Wifi,
    /// Bluetooth radio enabled
    Bluetooth,
}

impl Dimension {
    /// Category this dimension belongs to
    #[must_use]
    pub const fn category(&self) -> DimensionCategory {
        match self {
            Self::SystemFeature { .. } => DimensionCategory::Precondition,
            Self::UserPresent { .. } => DimensionCategory::User,
            Self::CurrentUser => DimensionCategory::UserSwitch,
            Self::DeviceOwner | Self::ProfileOwner { .. } => DimensionCategory::Admin,
            Self::PermissionGranted { .. } => DimensionCategory::Permission,
            Self::Policy { .. } => DimensionCategory::Policy,
            Self::UserRestriction { .. } => DimensionCategory::Restriction,
            Self::FeatureFlag { .. } => DimensionCategory::FeatureFlag,
            Self::GlobalSetting { .. } => DimensionCategory::Setting,
            Self::Wifi | Self::Bluetooth => DimensionCategory::Radio,
        }
    }

    /// Whether the orchestrator may change this dimension
    #[must_use]
    pub const fn is_mutable(&self) -> bool {
        self.category().is_mutable()
    }

    /// Value the dimension holds when nothing has been configured
    #[must_use]
    pub const fn default_value(&self) -> StateValue {
        match self {
            Self::SystemFeature { .. }
            | Self::UserPresent { .. }
            | Self::PermissionGranted { .. }
            | Self::UserRestriction { .. }
            | Self::Wifi
            | Self::Bluetooth => StateValue::Bool(false),
            _ => StateValue::Absent,
        }
    }

    /// Shorthand for [`Dimension::UserPresent`]
    pub fn user(user_type: impl Into<String>) -> Self {
        Self::UserPresent {
            user_type: user_type.into(),
        }
    }

    /// Shorthand for [`Dimension::Policy`]
    pub fn policy(name: impl Into<String>) -> Self {
        Self::Policy { name: name.into() }
    }

    /// Shorthand for [`Dimension::FeatureFlag`]
    pub fn feature_flag(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self::FeatureFlag {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Shorthand for [`Dimension::GlobalSetting`]
    pub fn global_setting(key: impl Into<String>) -> Self {
        Self::GlobalSetting { key: key.into() }
    }

    /// Shorthand for [`Dimension::SystemFeature`]
    pub fn system_feature(name: impl Into<String>) -> Self {
        Self::SystemFeature { name: name.into() }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemFeature { name } => write!(f, "system_feature[{name}]"),
            Self::UserPresent { user_type } => write!(f, "user[{user_type}]"),
            Self::CurrentUser => f.write_str("current_user"),
            Self::DeviceOwner => f.write_str("device_owner"),
            Self::ProfileOwner { user_type } => write!(f, "profile_owner[{user_type}]"),
            Self::PermissionGranted {
                package,
                permission,
            } => write!(f, "permission[{package}:{permission}]"),
            Self::Policy { name } => write!(f, "policy[{name}]"),
            Self::UserRestriction {
                user_type,
                restriction,
            } => write!(f, "restriction[{user_type}:{restriction}]"),
            Self::FeatureFlag { namespace, key } => write!(f, "flag[{namespace}/{key}]"),
            Self::GlobalSetting { key } => write!(f, "setting[{key}]"),
            Self::Wifi => f.write_str("wifi"),
            Self::Bluetooth => f.write_str("bluetooth"),
        }
    }
}

// =============================================================================
// CATEGORY
// =============================================================================

/// Dimension category. Declaration order is plan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionCategory {
    /// Read-only facts about the device
    Precondition,
    /// User existence
    User,
    /// Foreground user
    UserSwitch,
    /// Device and profile owners
    Admin,
    /// Permission grants
    Permission,
    /// Device policies
    Policy,
    /// User restrictions
    Restriction,
    /// Feature flags
    FeatureFlag,
    /// Settings
    Setting,
    /// Radios
    Radio,
}

impl DimensionCategory {
    /// Every category, in plan order
    pub const ALL: [Self; 10] = [
        Self::Precondition,
        Self::User,
        Self::UserSwitch,
        Self::Admin,
        Self::Permission,
        Self::Policy,
        Self::Restriction,
        Self::FeatureFlag,
        Self::Setting,
        Self::Radio,
    ];

    /// Plan priority; lower values are applied first
    #[must_use]
    pub const fn priority(self) -> u8 {
        self as u8
    }

    /// Whether dimensions of this category can be changed
    #[must_use]
    pub const fn is_mutable(self) -> bool {
        !matches!(self, Self::Precondition)
    }
}

// =============================================================================
// STATE VALUE
// =============================================================================

/// Value held by a dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Nothing is set
    Absent,
    /// Boolean state
    Bool(bool),
    /// Integer state
    Int(i64),
    /// Text state, e.g. a component name
    Text(String),
    /// Set of strings, e.g. policy arguments
    Set(BTreeSet<String>),
}

impl StateValue {
    /// Text value
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Set value
    pub fn set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Set(items.into_iter().map(Into::into).collect())
    }

    /// Whether the value is [`StateValue::Absent`]
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Boolean content, if this is a boolean
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Text content, if this is text
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Parse a scalar as printed by a device command
    #[must_use]
    pub fn parse_scalar(raw: &str) -> Self {
        match raw.trim() {
            "" | "null" => Self::Absent,
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            other => other
                .parse::<i64>()
                .map_or_else(|_| Self::Text(other.to_string()), Self::Int),
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "\"{value}\""),
            Self::Set(items) => {
                let joined: Vec<&str> = items.iter().map(String::as_str).collect();
                write!(f, "{{{}}}", joined.join(", "))
            }
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    mod category_tests {
        use super::*;

        #[test]
        fn test_users_precede_admins_precede_radios() {
            assert!(
                Dimension::user("secondary").category().priority()
                    < Dimension::DeviceOwner.category().priority()
            );
            assert!(
                Dimension::policy("camera_disabled").category()
                    < Dimension::global_setting("adb_enabled").category()
            );
            assert!(Dimension::DeviceOwner.category() < Dimension::Wifi.category());
        }

        #[test]
        fn test_only_preconditions_are_read_only() {
            assert!(!Dimension::system_feature("nfc").is_mutable());
            assert!(DimensionCategory::ALL
                .iter()
                .filter(|c| !c.is_mutable())
                .eq([&DimensionCategory::Precondition]));
            assert!(Dimension::Wifi.is_mutable());
        }
    }

    mod serde_tests {
        use super::*;

        #[test]
        fn test_dimension_yaml_shape() {
            let dim: Dimension =
                serde_yaml_ng::from_str("kind: feature_flag\nnamespace: ui\nkey: dark_mode")
                    .unwrap();
            assert_eq!(dim, Dimension::feature_flag("ui", "dark_mode"));
            let radio: Dimension = serde_yaml_ng::from_str("kind: wifi").unwrap();
            assert_eq!(radio, Dimension::Wifi);
        }

        #[test]
        fn test_state_value_untagged() {
            let values: Vec<StateValue> =
                serde_json::from_str(r#"[null, true, 7, "com.example/.Admin", ["a", "b"]]"#)
                    .unwrap();
            assert_eq!(
                values,
                vec![
                    StateValue::Absent,
                    StateValue::Bool(true),
                    StateValue::Int(7),
                    StateValue::text("com.example/.Admin"),
                    StateValue::set(["a", "b"]),
                ]
            );
        }
    }

    #[test]
    fn test_parse_scalar() {
        assert_eq!(StateValue::parse_scalar("true"), StateValue::Bool(true));
        assert_eq!(StateValue::parse_scalar(" 12 "), StateValue::Int(12));
        assert_eq!(StateValue::parse_scalar("null"), StateValue::Absent);
        assert_eq!(StateValue::parse_scalar("dark"), StateValue::text("dark"));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Dimension::feature_flag("ui", "dark_mode").to_string(),
            "flag[ui/dark_mode]"
        );
        assert_eq!(StateValue::set(["b", "a"]).to_string(), "{a, b}");
    }
}
