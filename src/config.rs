//! Engine configuration: storage location, collaborator time limits and
//! logging. Read from an optional TOML file, then environment overrides.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_DB_PATH: &str = "REQUEST_WORKFLOW_DB_PATH";
pub const ENV_RESOLVER_TIMEOUT_MS: &str = "REQUEST_WORKFLOW_RESOLVER_TIMEOUT_MS";
pub const ENV_NOTIFIER_TIMEOUT_MS: &str = "REQUEST_WORKFLOW_NOTIFIER_TIMEOUT_MS";
pub const ENV_LOG_LEVEL: &str = "REQUEST_WORKFLOW_LOG_LEVEL";

const MAX_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Throw the database away on close. Tests and demos only.
    pub temporary: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Directory and template lookups. Expiry fails the operation.
    pub resolver_ms: u64,
    /// Audit sink delivery. Expiry is logged and ignored.
    pub notifier_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("request-workflow.db"),
            temporary: false,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            resolver_ms: 3_000,
            notifier_ms: 2_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl TimeoutConfig {
    pub fn resolver(&self) -> Duration {
        Duration::from_millis(self.resolver_ms)
    }
    pub fn notifier(&self) -> Duration {
        Duration::from_millis(self.notifier_ms)
    }
}

impl StorageConfig {
    pub fn open(&self) -> sled::Result<sled::Db> {
        sled::Config::new()
            .path(&self.path)
            .temporary(self.temporary)
            .open()
    }
}

impl EngineConfig {
    /// File (if given and present), then process environment, then checks.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(value) = lookup(ENV_RESOLVER_TIMEOUT_MS) {
            self.timeouts.resolver_ms = parse_millis(ENV_RESOLVER_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_NOTIFIER_TIMEOUT_MS) {
            self.timeouts.notifier_ms = parse_millis(ENV_NOTIFIER_TIMEOUT_MS, &value)?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.storage.temporary && self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "storage.path must be set unless storage.temporary is true".to_string(),
            ));
        }
        for (name, value) in [
            ("timeouts.resolver_ms", self.timeouts.resolver_ms),
            ("timeouts.notifier_ms", self.timeouts.notifier_ms),
        ] {
            if value == 0 || value > MAX_TIMEOUT_MS {
                return Err(ConfigError::Validation(format!(
                    "{name} must be within 1..={MAX_TIMEOUT_MS}, got {value}"
                )));
            }
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "logging.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}
