//! Configuration parsing and management.
//!
//! A single TOML file configures the ledger store, the drift monitor and
//! the default audit policy. Every field has a default, so an empty file is
//! a valid configuration.
//!
//! ```toml
//! [ledger]
//! database = "/var/lib/charter/ledger.db"
//! busy_timeout_ms = 5000
//! page_size = 500
//!
//! [drift]
//! threshold_secs = 5.0
//!
//! [audit]
//! trusted_keys = "/etc/charter/keys.toml"
//! allow_gaps = false
//! require_signatures = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{DEFAULT_BUSY_TIMEOUT, DEFAULT_PAGE_SIZE, LedgerOptions};
use crate::time::DEFAULT_DRIFT_THRESHOLD;
use crate::toolkit::AuditPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Store settings.
    #[serde(default)]
    pub ledger: StoreConfig,

    /// Drift monitor settings.
    #[serde(default)]
    pub drift: DriftConfig,

    /// Default audit settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl LedgerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.page_size == 0 {
            return Err(ConfigError::Validation(
                "ledger.page_size must be at least 1".to_string(),
            ));
        }
        let threshold = self.drift.threshold_secs;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::Validation(format!(
                "drift.threshold_secs must be a non-negative number, got {threshold}"
            )));
        }
        Ok(())
    }

    /// Options for [`Ledger::open_with_options`](crate::ledger::Ledger::open_with_options).
    #[must_use]
    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            busy_timeout: Duration::from_millis(self.ledger.busy_timeout_ms),
            drift_threshold: self.drift_threshold(),
        }
    }

    /// Drift threshold as a duration.
    #[must_use]
    pub fn drift_threshold(&self) -> Duration {
        Duration::try_from_secs_f64(self.drift.threshold_secs).unwrap_or(DEFAULT_DRIFT_THRESHOLD)
    }

    /// Audit gate settings.
    #[must_use]
    pub const fn audit_policy(&self) -> AuditPolicy {
        AuditPolicy {
            allow_gaps: self.audit.allow_gaps,
            require_signatures: self.audit.require_signatures,
        }
    }
}

/// `[ledger]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Path to the `SQLite` database.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// How long an append waits for another writer.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Events per page for scans and exports.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            busy_timeout_ms: default_busy_timeout_ms(),
            page_size: default_page_size(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("charter.db")
}

#[allow(clippy::cast_possible_truncation)]
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT.as_millis() as u64
}

const fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// `[drift]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriftConfig {
    /// Tolerated local/authority difference in seconds.
    #[serde(default = "default_threshold_secs")]
    pub threshold_secs: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            threshold_secs: default_threshold_secs(),
        }
    }
}

fn default_threshold_secs() -> f64 {
    DEFAULT_DRIFT_THRESHOLD.as_secs_f64()
}

/// `[audit]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Trusted key file used when none is given on the command line.
    #[serde(default)]
    pub trusted_keys: Option<PathBuf>,

    /// Sequence gaps do not fail an audit.
    #[serde(default)]
    pub allow_gaps: bool,

    /// Every event must carry a valid writer signature.
    #[serde(default)]
    pub require_signatures: bool,
}

/// Configuration errors.
#[derive(Debug, Error)]
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
