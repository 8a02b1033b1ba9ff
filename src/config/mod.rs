use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_PROJECT_NAME: &str = "dataswarm";
pub const DEFAULT_CATALOG_PORT: u16 = 9097;
pub const MIN_POLL_INTERVAL_MS: u64 = 10;
pub const MAX_POLL_INTERVAL_MS: u64 = 1_000;
pub const MIN_MESSAGE_SIZE_BYTES: usize = 1024;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub manager: ManagerConfig,
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub logging: LoggingConfig,
    pub catalog: CatalogConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ManagerConfig {
    pub project_name: String,
    pub connect_timeout_seconds: u64,
    pub stall_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub max_events_per_cycle: usize,
    pub file_quorum: usize,
    pub max_queued_notifications: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            project_name: DEFAULT_PROJECT_NAME.to_owned(),
            connect_timeout_seconds: 5,
            stall_timeout_seconds: 30,
            poll_interval_ms: 100,
            max_events_per_cycle: 256,
            file_quorum: 1,
            max_queued_notifications: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 9123,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WireConfig {
    pub max_message_size_bytes: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_message_size_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
    pub debug_subsystems: Vec<String>,
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
            debug_subsystems: Vec::new(),
            file: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CatalogConfig {
    pub enabled: bool,
    pub hosts: Vec<String>,
    pub update_interval_seconds: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hosts: vec![format!("catalog.cse.nd.edu:{DEFAULT_CATALOG_PORT}")],
            update_interval_seconds: 60,
        }
    }
}

impl AppConfig {
    /// Builds the effective configuration: defaults, then the optional TOML
    /// file, then `section.key=value` overrides checked against the type
    /// already present at that path.
    pub fn load(
        path: Option<&Path>,
        overrides: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value = Value::try_from(AppConfig::default()).map_err(ConfigError::Defaults)?;

        if let Some(path) = path {
            let file_value = read_toml(path)?;
            merge_tables(&mut root_value, file_value);
        }

        for raw in overrides {
            let (key_path, raw_value) = parse_override(&raw)?;
            apply_override(&mut root_value, key_path, raw_value)?;
        }

        let config: AppConfig = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manager.file_quorum == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "manager.file_quorum",
                reason: "must be at least 1".to_owned(),
            });
        }
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&self.manager.poll_interval_ms) {
            return Err(ConfigError::InvalidSetting {
                key: "manager.poll_interval_ms",
                reason: format!(
                    "must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
                ),
            });
        }
        if self.manager.max_queued_notifications == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "manager.max_queued_notifications",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.manager.max_events_per_cycle == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "manager.max_events_per_cycle",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.manager.project_name.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "manager.project_name",
                reason: "must not be empty".to_owned(),
            });
        }
        if self.wire.max_message_size_bytes < MIN_MESSAGE_SIZE_BYTES {
            return Err(ConfigError::InvalidSetting {
                key: "wire.max_message_size_bytes",
                reason: format!("must be at least {MIN_MESSAGE_SIZE_BYTES}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Defaults(toml::ser::Error),
    Deserialize(toml::de::Error),
    InvalidOverrideFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidSetting {
        key: &'static str,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Defaults(source) => write!(f, "failed to render default config: {source}"),
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::InvalidOverrideFormat { arg } => write!(
                f,
                "invalid override '{arg}', expected 'section.key=value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidSetting { key, reason } => write!(f, "invalid setting '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn read_toml(path: &Path) -> Result<Value, ConfigError> {
    let display_path = path.to_string_lossy().to_string();
    let toml_content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display_path.clone(),
        source,
    })?;

    toml_content
        .parse::<Value>()
        .map_err(|source| ConfigError::TomlParse {
            path: display_path,
            source,
        })
}

// Tables merge key by key; any other value in `overlay` replaces the base.
fn merge_tables(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_tables(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_override(raw: &str) -> Result<(&str, &str), ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => Err(ConfigError::InvalidOverrideFormat {
            arg: raw.to_owned(),
        }),
    }
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    let final_key = parts[parts.len() - 1];
    let current_value = current
        .as_table_mut()
        .ok_or_else(unknown)?
        .get_mut(final_key)
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        // Lists are written comma separated: `catalog.hosts=a:9097,b`.
        Value::Array(items) if items.iter().all(Value::is_str) => Ok(Value::Array(
            raw_value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_owned()))
                .collect(),
        )),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
