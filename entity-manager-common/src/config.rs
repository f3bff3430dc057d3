use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Filesystem layout of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Package template library.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Host overlay directory; files with the same base name replace
    /// package entries.
    #[serde(default = "default_host_config_dir")]
    pub host_config_dir: PathBuf,

    /// Per-type and global schema directory.
    #[serde(default = "default_schema_dir")]
    pub schema_dir: PathBuf,

    /// Persisted current system configuration.
    #[serde(default = "default_current_configuration")]
    pub current_configuration: PathBuf,

    /// Previous system configuration, copied at startup when the firmware
    /// version is unchanged.
    #[serde(default = "default_last_configuration")]
    pub last_configuration: PathBuf,

    /// Witness of the firmware version the persisted configuration was
    /// written under.
    #[serde(default = "default_version_file")]
    pub version_file: PathBuf,

    /// Source of the running firmware version.
    #[serde(default = "default_os_release")]
    pub os_release: PathBuf,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/usr/share/entity-manager/configurations")
}

fn default_host_config_dir() -> PathBuf {
    PathBuf::from("/etc/entity-manager/configurations")
}

fn default_schema_dir() -> PathBuf {
    PathBuf::from("/usr/share/entity-manager/configurations/schemas")
}

fn default_current_configuration() -> PathBuf {
    PathBuf::from("/var/configuration/system.json")
}

fn default_last_configuration() -> PathBuf {
    PathBuf::from("/tmp/configuration/last.json")
}

fn default_version_file() -> PathBuf {
    PathBuf::from("/var/configuration/version")
}

fn default_os_release() -> PathBuf {
    PathBuf::from("/etc/os-release")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            host_config_dir: default_host_config_dir(),
            schema_dir: default_schema_dir(),
            current_configuration: default_current_configuration(),
            last_configuration: default_last_configuration(),
            version_file: default_version_file(),
            os_release: default_os_release(),
        }
    }
}

/// Timer windows of the scan pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Coalescing window for dirty pulses, in seconds.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Settle delay after the first observed power-on before pruning of
    /// power-dependent entities becomes authoritative, in seconds.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

fn default_debounce_secs() -> u64 {
    5
}

fn default_settle_secs() -> u64 {
    10
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            settle_secs: default_settle_secs(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
