//! Configuration system for cloudq.
//!
//! Configuration is read from a TOML file. Every section and field is optional;
//! anything left out falls back to its default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::registry::QueueDefaults;
use crate::service::ServiceOptions;
use crate::types::validation::{
    validate_max_message_size, validate_max_receives, validate_retention_period,
    validate_visibility_timeout,
};
use crate::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudqConfig {
    /// Server configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Background task configuration.
    pub scheduler: SchedulerConfig,
    /// Settings for queues created without them.
    pub queue_defaults: QueueDefaults,
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_address: String,
    /// REST API port.
    pub api_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            api_port: 9400,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend type.
    pub backend: BackendConfig,
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendConfig {
    /// In-memory backend.
    InMemory {
        /// Maximum number of messages across all queues.
        max_messages: usize,
    },
    /// SQLite backend.
    Sqlite {
        /// Database file path.
        database_path: String,
        /// Connection pool size.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::InMemory {
            max_messages: 100_000,
        }
    }
}

/// Background task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Visibility sweep interval in milliseconds.
    pub check_interval_ms: u64,
    /// Retention pass interval in seconds.
    pub retention_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 500,
            retention_interval_secs: 60,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive.
    pub level: String,
    /// Log format (text or json).
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log format enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format.
    Text,
    /// JSON format.
    Json,
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics.
    pub enabled: bool,
    /// Metrics port.
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl CloudqConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.api_port == 0 {
            return Err(Error::Config("server.api_port must not be 0".to_string()));
        }
        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(Error::Config("metrics.port must not be 0".to_string()));
            }
            if self.metrics.port == self.server.api_port {
                return Err(Error::Config(format!(
                    "metrics.port and server.api_port are both {}",
                    self.server.api_port
                )));
            }
        }

        if self.scheduler.check_interval_ms == 0 {
            return Err(Error::Config(
                "scheduler.check_interval_ms must be positive".to_string(),
            ));
        }
        if self.scheduler.retention_interval_secs == 0 {
            return Err(Error::Config(
                "scheduler.retention_interval_secs must be positive".to_string(),
            ));
        }

        match &self.storage.backend {
            BackendConfig::InMemory { max_messages } if *max_messages == 0 => {
                return Err(Error::Config(
                    "storage.backend.max_messages must be positive".to_string(),
                ));
            }
            BackendConfig::Sqlite {
                database_path,
                max_connections,
            } => {
                if database_path.is_empty() {
                    return Err(Error::Config(
                        "storage.backend.database_path must not be empty".to_string(),
                    ));
                }
                if *max_connections == 0 {
                    return Err(Error::Config(
                        "storage.backend.max_connections must be positive".to_string(),
                    ));
                }
            }
            BackendConfig::InMemory { .. } => {}
        }

        let defaults = &self.queue_defaults;
        validate_visibility_timeout(defaults.visibility_timeout)
            .and_then(|_| validate_max_receives(defaults.max_receives))
            .and_then(|_| validate_retention_period(defaults.message_retention_period))
            .and_then(|_| validate_max_message_size(defaults.max_message_size))
            .map_err(|e| Error::Config(format!("queue_defaults: {}", e)))?;

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            return Err(Error::Config(format!(
                "logging.level is not a valid filter: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Service tunables derived from this configuration.
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            check_interval: Duration::from_millis(self.scheduler.check_interval_ms),
            retention_interval: Duration::from_secs(self.scheduler.retention_interval_secs),
            queue_defaults: self.queue_defaults.clone(),
            ..ServiceOptions::default()
        }
    }
}
