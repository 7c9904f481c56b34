//! Console configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/console.toml` (or an explicit path)
//! 3. Environment variables prefixed with `DAQ_MARSHAL_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use daq_marshal::config::ConsoleConfig;
//!
//! let config = ConsoleConfig::load()?;
//! config.validate()?;
//! println!("{} workers", config.workers.count);
//! # Ok::<(), daq_marshal::error::ConsoleError>(())
//! ```

use crate::error::{AppResult, ConsoleError};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::marshal::DispatchMode;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/console.toml";

/// Prefix of environment overrides, e.g. `DAQ_MARSHAL_WORKERS__COUNT=4`.
pub const ENV_PREFIX: &str = "DAQ_MARSHAL_";

/// Top-level console configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Name and log level
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Worker threads for device operations
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Task defaults
    #[serde(default)]
    pub tasks: TaskConfig,
    /// Event bus settings
    #[serde(default)]
    pub events: EventConfig,
    /// Devices the console manages
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Display name, logged at startup
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "DAQ Marshal Console".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Worker thread pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker threads; must be at least one
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Worker threads are named `<prefix>-<index>`
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

/// Defaults applied to submitted tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// How task reports are delivered unless the sink asks otherwise
    #[serde(default = "default_completion")]
    pub completion: DispatchMode,
    /// Time limit checked at task checkpoints; none if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            completion: default_completion(),
            timeout_ms: None,
        }
    }
}

impl TaskConfig {
    /// `timeout_ms` as a duration; `None` means no limit.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Broadcast buffer size; slow subscribers lag beyond it
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier, used as the lock key
    pub id: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

// Default value functions
fn default_worker_count() -> usize {
    1
}

fn default_thread_name_prefix() -> String {
    "daq-worker".to_string()
}

fn default_completion() -> DispatchMode {
    DispatchMode::FireAndForget
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl ConsoleConfig {
    /// Load configuration from `config/console.toml` and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file leaves the
    /// defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConsoleError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level = self.application.log_level.to_lowercase();
        if !valid_levels.contains(&level.as_str()) {
            return Err(ConsoleError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.workers.count == 0 {
            return Err(ConsoleError::Configuration(
                "workers.count must be at least 1".to_string(),
            ));
        }

        if self.events.capacity == 0 {
            return Err(ConsoleError::Configuration(
                "events.capacity must be at least 1".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(device.id.as_str()) {
                return Err(ConsoleError::Configuration(format!(
                    "Duplicate device ID: {}",
                    device.id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn missing_file_yields_defaults() {
        let config = ConsoleConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, ConsoleConfig::default());
        assert_eq!(config.workers.count, 1);
        assert_eq!(config.tasks.completion, DispatchMode::FireAndForget);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn file_values_override_defaults() {
        let file = write_config(
            r#"
            [application]
            name = "Bench console"
            log_level = "debug"

            [workers]
            count = 3

            [tasks]
            completion = "blocking"
            timeout_ms = 1500

            [[devices]]
            id = "dev0"
            description = "Main channel"
            "#,
        );
        let config = ConsoleConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "Bench console");
        assert_eq!(config.workers.count, 3);
        assert_eq!(config.workers.thread_name_prefix, "daq-worker");
        assert_eq!(config.tasks.completion, DispatchMode::Blocking);
        assert_eq!(config.tasks.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.devices.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let file = write_config("[workers]\ncount = 2\n");
        std::env::set_var("DAQ_MARSHAL_WORKERS__COUNT", "5");
        let config = ConsoleConfig::load_from(file.path());
        std::env::remove_var("DAQ_MARSHAL_WORKERS__COUNT");
        assert_eq!(config.unwrap().workers.count, 5);
    }

    #[test]
    #[serial]
    fn malformed_file_is_a_config_error() {
        let file = write_config("[workers]\ncount = \"many\"\n");
        assert!(matches!(
            ConsoleConfig::load_from(file.path()),
            Err(ConsoleError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ConsoleConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConsoleError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = ConsoleConfig::default();
        config.workers.count = 0;
        assert!(config.validate().is_err());

        let mut config = ConsoleConfig::default();
        config.events.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_device_ids() {
        let device = DeviceDefinition {
            id: "dev0".to_string(),
            description: String::new(),
        };
        let config = ConsoleConfig {
            devices: vec![device.clone(), device],
            ..ConsoleConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate device ID: dev0"));
    }
}
