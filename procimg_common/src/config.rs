//! Configuration loading traits and types.
//!
//! This module provides the TOML settings layer shared by every binary of
//! the workspace. The piCtory hardware description itself is JSON and lives
//! in [`crate::io::config`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use procimg_common::config::{ConfigError, ConfigLoader, SyncSettings};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let settings = SyncSettings::load(Path::new("procimg.toml"))?;
//!     settings.validate()?;
//!     println!("Process image: {}", settings.procimg.display());
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::consts::{CONFIG_RSC_PATHS, DEFAULT_PROCIMG, MAX_CYCLE_TIME_MS, MIN_CYCLE_TIME_MS};

/// Error type for configuration loading operations.
///
/// This enum represents all possible errors that can occur when loading
/// settings or the piCtory configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML or JSON parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Device selector: a position number or a device name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceKey {
    /// Position number of the device in piCtory.
    Position(u16),
    /// Device name as configured in piCtory.
    Name(String),
}

impl From<u16> for DeviceKey {
    fn from(position: u16) -> Self {
        Self::Position(position)
    }
}

impl From<&str> for DeviceKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Position(p) => write!(f, "{p}"),
            Self::Name(n) => f.write_str(n),
        }
    }
}

/// Settings of a process image instance.
///
/// # TOML Example
///
/// ```toml
/// procimg = "/dev/piControl0"
/// cycle_time_ms = 20
/// max_io_errors = 5
/// autorefresh = true
/// replace_io_file = "/etc/revpi/replace_ios.conf"
/// log_level = "debug"
/// devices = [32, "virt01"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    /// Path of the process image device or a plain file for simulation.
    #[serde(default = "default_procimg")]
    pub procimg: PathBuf,

    /// Path of the piCtory configuration; searched at known places if absent.
    #[serde(default)]
    pub config_rsc: Option<PathBuf>,

    /// Cycle time of the sync engine; device based default if absent.
    #[serde(default)]
    pub cycle_time_ms: Option<u32>,

    /// I/O errors tolerated before the engine stops, 0 = unlimited.
    #[serde(default)]
    pub max_io_errors: u32,

    /// Read-only mode: copy the full image, never write back.
    #[serde(default)]
    pub monitoring: bool,

    /// Simulator mode: inputs and outputs swap roles.
    #[serde(default)]
    pub simulator: bool,

    /// Write every set value directly to the process image.
    #[serde(default)]
    pub shared_procimg: bool,

    /// Read current outputs from the process image at startup.
    #[serde(default = "default_true")]
    pub syncoutputs: bool,

    /// Put all devices into autorefresh at startup.
    #[serde(default)]
    pub autorefresh: bool,

    /// Replace-IO definitions to import at startup.
    #[serde(default)]
    pub replace_io_file: Option<PathBuf>,

    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Restrict the instance to these devices (empty = all).
    #[serde(default)]
    pub devices: Vec<DeviceKey>,

    /// Restrict the instance to devices of this piCtory type, e.g. "VIRTUAL".
    #[serde(default)]
    pub device_type: Option<String>,
}

fn default_procimg() -> PathBuf {
    PathBuf::from(DEFAULT_PROCIMG)
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            procimg: default_procimg(),
            config_rsc: None,
            cycle_time_ms: None,
            max_io_errors: 0,
            monitoring: false,
            simulator: false,
            shared_procimg: false,
            syncoutputs: true,
            autorefresh: false,
            replace_io_file: None,
            log_level: LogLevel::Info,
            devices: Vec::new(),
            device_type: None,
        }
    }
}

impl SyncSettings {
    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `cycle_time_ms` is outside 5..=2000
    /// - `monitoring` and `simulator` are both set
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ms) = self.cycle_time_ms {
            validate_cycle_time(ms)?;
        }
        if self.monitoring && self.simulator {
            return Err(ConfigError::ValidationError(
                "monitoring and simulator mode are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the piCtory configuration path.
    ///
    /// An explicit `config_rsc` must exist. Otherwise the first existing
    /// file of [`CONFIG_RSC_PATHS`] is used.
    pub fn resolve_config_rsc(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.config_rsc {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(ConfigError::FileNotFound);
        }
        CONFIG_RSC_PATHS
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "can not access known pictory configurations at {}",
                    CONFIG_RSC_PATHS.join(", ")
                ))
            })
    }
}

/// Check a cycle time against the engine bounds.
pub fn validate_cycle_time(ms: u32) -> Result<(), ConfigError> {
    if (MIN_CYCLE_TIME_MS..=MAX_CYCLE_TIME_MS).contains(&ms) {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "cycle time must be {MIN_CYCLE_TIME_MS} to {MAX_CYCLE_TIME_MS} milliseconds, got {ms}"
        )))
    }
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Warn.as_directive(), "warn");
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize)]
        struct TestWrapper {
            level: LogLevel,
        }

        assert_eq!(
            toml::from_str::<TestWrapper>("level = \"trace\"").unwrap().level,
            LogLevel::Trace
        );
        assert_eq!(
            toml::from_str::<TestWrapper>("level = \"error\"").unwrap().level,
            LogLevel::Error
        );
    }

    #[test]
    fn test_settings_defaults() {
        let settings: SyncSettings = toml::from_str("").unwrap();
        assert_eq!(settings.procimg, PathBuf::from(DEFAULT_PROCIMG));
        assert!(settings.syncoutputs);
        assert!(!settings.autorefresh);
        assert_eq!(settings.max_io_errors, 0);
        assert!(settings.cycle_time_ms.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_cycle_time_bounds() {
        let mut settings = SyncSettings::default();
        settings.cycle_time_ms = Some(4);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        settings.cycle_time_ms = Some(2001);
        assert!(settings.validate().is_err());
        settings.cycle_time_ms = Some(5);
        assert!(settings.validate().is_ok());
        settings.cycle_time_ms = Some(2000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_monitoring_and_simulator() {
        let settings = SyncSettings {
            monitoring: true,
            simulator: true,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_device_keys_mixed() {
        let settings: SyncSettings = toml::from_str("devices = [32, \"virt01\"]").unwrap();
        assert_eq!(
            settings.devices,
            vec![DeviceKey::Position(32), DeviceKey::Name("virt01".to_string())]
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = toml::from_str::<SyncSettings>("cycletime = 20");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = SyncSettings::load(Path::new("/nonexistent/path/procimg.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = SyncSettings::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_loader_success() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"procimg = "/tmp/procimg.bin"
cycle_time_ms = 50
monitoring = true
log_level = "debug"
"#
        )
        .unwrap();
        file.flush().unwrap();

        let settings = SyncSettings::load(file.path()).unwrap();
        assert_eq!(settings.procimg, PathBuf::from("/tmp/procimg.bin"));
        assert_eq!(settings.cycle_time_ms, Some(50));
        assert!(settings.monitoring);
        assert_eq!(settings.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_explicit_config_rsc_missing() {
        let settings = SyncSettings {
            config_rsc: Some(PathBuf::from("/nonexistent/config.rsc")),
            ..Default::default()
        };
        assert!(matches!(
            settings.resolve_config_rsc(),
            Err(ConfigError::FileNotFound)
        ));
    }
}
