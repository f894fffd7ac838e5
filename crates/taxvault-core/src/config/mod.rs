//! Configuration parsing and management.
//!
//! Configuration lives in a single TOML file with `[database]`,
//! `[reconcile]`, and `[log]` sections. Every field has a default, so an
//! empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ledger::{LedgerError, LedgerStore};

/// Shortest allowed reconciliation interval.
pub const MIN_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Longest allowed reconciliation interval (one week).
pub const MAX_RECONCILE_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest allowed movement window (five years).
pub const MAX_MOVEMENT_WINDOW_SECS: u64 = 5 * 366 * 24 * 60 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaxvaultConfig {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Scheduled reconciliation.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

impl TaxvaultConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.reconcile.interval_secs;
        if !(MIN_RECONCILE_INTERVAL_SECS..=MAX_RECONCILE_INTERVAL_SECS).contains(&interval) {
            return Err(ConfigError::Validation(format!(
                "reconcile.interval_secs must be between {MIN_RECONCILE_INTERVAL_SECS} and \
                 {MAX_RECONCILE_INTERVAL_SECS}, got {interval}"
            )));
        }
        if self.reconcile.movement_window_secs == 0 {
            return Err(ConfigError::Validation(
                "reconcile.movement_window_secs must be positive".to_string(),
            ));
        }
        if self.reconcile.movement_window_secs > MAX_MOVEMENT_WINDOW_SECS {
            return Err(ConfigError::Validation(format!(
                "reconcile.movement_window_secs must be at most {MAX_MOVEMENT_WINDOW_SECS}, got {}",
                self.reconcile.movement_window_secs
            )));
        }
        if self.reconcile.enabled && self.reconcile.org_ids.is_empty() {
            return Err(ConfigError::Validation(
                "reconcile.org_ids must list at least one organisation when enabled".to_string(),
            ));
        }
        if self.reconcile.org_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "reconcile.org_ids must not contain empty identifiers".to_string(),
            ));
        }
        if self.reconcile.actor_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "reconcile.actor_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the `SQLite` file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// How long a writer waits for the database lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Opens the configured store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(&self) -> Result<LedgerStore, LedgerError> {
        LedgerStore::open_with_busy_timeout(&self.path, Duration::from_millis(self.busy_timeout_ms))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Scheduled reconciliation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Run the scheduler in `reconcile serve`.
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between passes.
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,

    /// Trailing window for inflow totals, in seconds.
    #[serde(default = "default_movement_window")]
    pub movement_window_secs: u64,

    /// Organisations to reconcile.
    #[serde(default)]
    pub org_ids: Vec<String>,

    /// Actor recorded on snapshots and audit entries.
    #[serde(default = "default_actor_id")]
    pub actor_id: String,
}

impl ReconcileConfig {
    /// Interval between passes.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Movement window as a `chrono` duration.
    #[must_use]
    pub fn movement_window(&self) -> chrono::Duration {
        i64::try_from(self.movement_window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(crate::reconcile::DEFAULT_MOVEMENT_WINDOW)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_reconcile_interval(),
            movement_window_secs: default_movement_window(),
            org_ids: Vec::new(),
            actor_id: default_actor_id(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("taxvault.db")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_reconcile_interval() -> u64 {
    24 * 60 * 60
}

const fn default_movement_window() -> u64 {
    24 * 60 * 60
}

fn default_actor_id() -> String {
    "system".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
