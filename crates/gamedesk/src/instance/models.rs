//! Instance data models.

use chrono::{SecondsFormat, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;

use crate::allocator::AllocationBundle;
use crate::container::validate_byte_size;

/// Instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Container launched, not yet confirmed healthy.
    Starting,
    /// Confirmed running by a health check.
    Running,
    /// Failed after launch.
    Failed,
    /// Teardown claimed; the record is about to disappear.
    Deleted,
}

impl InstanceStatus {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Starting, Running) | (Starting, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Deleted => write!(f, "deleted"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(InstanceStatus::Starting),
            "running" => Ok(InstanceStatus::Running),
            "failed" => Ok(InstanceStatus::Failed),
            "deleted" => Ok(InstanceStatus::Deleted),
            _ => Err(format!("unknown instance status: {}", s)),
        }
    }
}

impl TryFrom<String> for InstanceStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Effective per-instance settings, stored as a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Container memory limit, e.g. `4G`.
    pub memory_limit: String,
    /// CPU count as a decimal string.
    pub cpu_limit: String,
    pub enable_gpu: bool,
    pub enable_audio: bool,
    /// Password for the desktop user and the streaming host.
    pub user_password: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            memory_limit: "4G".to_string(),
            cpu_limit: "2".to_string(),
            enable_gpu: true,
            enable_audio: true,
            user_password: "gaming123".to_string(),
        }
    }
}

impl InstanceConfig {
    /// Check every field against its accepted format.
    pub fn validate(&self) -> Result<(), String> {
        validate_byte_size(&self.memory_limit, "memory_limit").map_err(|e| e.to_string())?;

        match self.cpu_limit.parse::<u32>() {
            Ok(n) if n > 0 => {}
            _ => {
                return Err(format!(
                    "cpu_limit must be a positive integer, got '{}'",
                    self.cpu_limit
                ));
            }
        }

        if self.user_password.is_empty() {
            return Err("user_password cannot be empty".to_string());
        }
        if self.user_password.contains('\0') {
            return Err("user_password cannot contain null bytes".to_string());
        }

        Ok(())
    }
}

impl TryFrom<String> for InstanceConfig {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        serde_json::from_str(&value).map_err(|e| format!("invalid instance config: {}", e))
    }
}

/// Caller-supplied settings; unset fields keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfigOverrides {
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_string_or_int")]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub enable_gpu: Option<bool>,
    #[serde(default)]
    pub enable_audio: Option<bool>,
    #[serde(default)]
    pub user_password: Option<String>,
}

impl InstanceConfigOverrides {
    /// Parse a string-keyed JSON object. Unknown keys and mistyped values are
    /// rejected.
    pub fn from_json(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => {
                serde_json::from_value(value).map_err(|e| format!("invalid config: {}", e))
            }
            other => Err(format!("config must be an object, got {}", other)),
        }
    }

    /// Merge onto `InstanceConfig::default()` field by field and validate
    /// the result.
    pub fn resolve(self) -> Result<InstanceConfig, String> {
        let mut config = InstanceConfig::default();
        if let Some(memory_limit) = self.memory_limit {
            config.memory_limit = memory_limit;
        }
        if let Some(cpu_limit) = self.cpu_limit {
            config.cpu_limit = cpu_limit;
        }
        if let Some(enable_gpu) = self.enable_gpu {
            config.enable_gpu = enable_gpu;
        }
        if let Some(enable_audio) = self.enable_audio {
            config.enable_audio = enable_audio;
        }
        if let Some(user_password) = self.user_password {
            config.user_password = user_password;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Accept `"2"` or `2` for a string field.
fn deserialize_opt_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrInt;

    impl<'de> Visitor<'de> for StringOrInt {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or an integer")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            Ok(Some(value.to_string()))
        }

        fn visit_string<E: de::Error>(self, value: String) -> Result<Self::Value, E> {
            Ok(Some(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            Ok(Some(value.to_string()))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(Some(value.to_string()))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(StringOrInt)
}

/// A provisioned gaming desktop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Instance {
    /// UUID v4.
    pub id: String,
    pub user_id: String,
    /// Runtime handle of the backing container.
    pub container_id: Option<String>,
    /// noVNC web port.
    pub novnc_port: i64,
    /// First of three streaming ports.
    pub sunshine_port: i64,
    pub display_number: i64,
    #[sqlx(try_from = "String")]
    pub status: InstanceStatus,
    /// RFC 3339, UTC, microseconds.
    pub created_at: String,
    pub last_accessed: String,
    #[sqlx(try_from = "String")]
    pub config: InstanceConfig,
}

impl Instance {
    /// The pool grants recorded on this instance, if they fit the id type.
    pub fn allocation(&self) -> Option<AllocationBundle> {
        Some(AllocationBundle {
            novnc_port: u32::try_from(self.novnc_port).ok()?,
            sunshine_port: u32::try_from(self.sunshine_port).ok()?,
            display: u32::try_from(self.display_number).ok()?,
        })
    }

    pub fn is_live(&self) -> bool {
        self.status != InstanceStatus::Deleted
    }
}

/// Request to create a new instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    /// Owner; defaults to `"default"`.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Raw config overrides, validated by the service.
    #[serde(default)]
    pub config: Option<Value>,
}

/// Outcome of a delete. Teardown problems are reported, not fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub instance_id: String,
    pub warnings: Vec<String>,
}

/// Outcome of rebuilding pool state from stored records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Live records whose grants were re-reserved.
    pub restored: usize,
    /// Records left over from interrupted deletes and removed.
    pub purged: usize,
    /// Live records whose grants could not be reserved.
    pub conflicts: usize,
}

/// Current time as a fixed-width RFC 3339 UTC timestamp.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
