//! Configuration management for the insights store
//!
//! This module provides configuration file support with TOML format,
//! environment variable overrides, and sensible defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Path value that selects a private in-memory database
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Backing store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Aggregation tuning
    #[serde(default)]
    pub query: QueryConfig,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Backing store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// SQLite database file, or `:memory:`
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How long a statement waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Use write-ahead logging for file-backed databases
    #[serde(default = "default_true")]
    pub wal: bool,
}

/// Which aggregation strategy serves queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Push-down below the threshold, in-process at or above it
    Auto,
    /// Always aggregate inside the store
    PushDown,
    /// Always aggregate in process
    InProcess,
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregationMode::Auto => "auto",
            AggregationMode::PushDown => "push_down",
            AggregationMode::InProcess => "in_process",
        })
    }
}

impl FromStr for AggregationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AggregationMode::Auto),
            "push_down" | "push-down" | "pushdown" => Ok(AggregationMode::PushDown),
            "in_process" | "in-process" | "inprocess" => Ok(AggregationMode::InProcess),
            other => Err(Error::Configuration(format!(
                "unknown aggregation mode: {}",
                other
            ))),
        }
    }
}

/// Aggregation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Strategy selection
    #[serde(default = "default_aggregation_mode")]
    pub aggregation: AggregationMode,

    /// Deny-list size at which `auto` switches to in-process aggregation
    #[serde(default = "default_in_process_deny_threshold")]
    pub in_process_deny_threshold: usize,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Record Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("insights.db")
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_aggregation_mode() -> AggregationMode {
    AggregationMode::Auto
}
fn default_in_process_deny_threshold() -> usize {
    1_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            wal: true,
        }
    }
}

impl StorageConfig {
    /// Configuration for a private in-memory database
    pub fn in_memory() -> Self {
        Self {
            database_path: PathBuf::from(IN_MEMORY_PATH),
            ..Self::default()
        }
    }

    /// Whether this configuration selects an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_PATH
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            aggregation: default_aggregation_mode(),
            in_process_deny_threshold: default_in_process_deny_threshold(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // Storage
        if let Ok(path) = std::env::var("INSIGHTS_DB_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Ok(timeout) = std::env::var("INSIGHTS_BUSY_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse() {
                self.storage.busy_timeout_ms = t;
            }
        }

        // Query
        if let Ok(mode) = std::env::var("INSIGHTS_AGGREGATION") {
            self.query.aggregation = mode.parse()?;
        }
        if let Ok(threshold) = std::env::var("INSIGHTS_DENY_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                self.query.in_process_deny_threshold = t;
            }
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.database_path.as_os_str().is_empty() {
            return Err(Error::Configuration(
                "Database path cannot be empty".to_string(),
            ));
        }
        if self.storage.busy_timeout_ms > 600_000 {
            return Err(Error::Configuration(
                "Busy timeout cannot exceed 10 minutes".to_string(),
            ));
        }
        if self.query.aggregation == AggregationMode::Auto
            && self.query.in_process_deny_threshold == 0
        {
            return Err(Error::Configuration(
                "In-process deny threshold must be > 0 in auto mode".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)?;
        Ok(())
    }
}
