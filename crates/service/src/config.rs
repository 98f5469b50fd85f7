//! Service configuration.
//!
//! Stored as a JSON file. Every field has a default, so a partial file (or
//! none at all) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chunkline_driver::{DEFAULT_PARALLELISM, DriverConfig};
use chunkline_protocol::{
    Coded, DEFAULT_CHUNK_SIZE, DEFAULT_SESSION_TTL_HOURS, ErrorCode, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
};
use chunkline_recovery::{RecoveryConfig, RetryPolicy};
use chunkline_transfer::{DEFAULT_SPEED_WINDOW, FinalizeConfig, SessionConfig};

/// Errors loading or saving a [`ServiceConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Coded for ConfigError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::StorageError,
            Self::Json(_) | Self::Invalid(_) => ErrorCode::InvalidMetadata,
        }
    }
}

/// Tunables of the upload service and the components it builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub chunk_size: u64,
    pub session_ttl_hours: i64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub finalize_lease_ttl_secs: i64,
    pub orphan_threshold_hours: i64,
    pub retry_log_retention_days: u32,
    pub cleanup_interval_secs: u64,
    pub speed_window: usize,
    pub driver_parallelism: usize,
    /// Directory finalized files are assembled into. Unset keeps artifacts
    /// as ledger records only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly_root: Option<PathBuf>,
    /// Concurrent active uploads the deployment is sized for.
    pub load_capacity: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let recovery = RecoveryConfig::default();
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
            max_retries: retry.max_retries,
            retry_base_delay_ms: retry.base_delay.as_millis() as u64,
            retry_max_delay_ms: retry.max_delay.as_millis() as u64,
            finalize_lease_ttl_secs: chunkline_transfer::finalize::DEFAULT_LEASE_TTL_SECS,
            orphan_threshold_hours: recovery.orphan_threshold.num_hours(),
            retry_log_retention_days: recovery.retry_log_retention_days,
            cleanup_interval_secs: recovery.cleanup_interval.as_secs(),
            speed_window: DEFAULT_SPEED_WINDOW,
            driver_parallelism: DEFAULT_PARALLELISM,
            assembly_root: None,
            load_capacity: recovery.capacity,
        }
    }
}

impl ServiceConfig {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field is in a range the components can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return invalid(format!(
                "chunkSize {} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}",
                self.chunk_size
            ));
        }
        if self.session_ttl_hours <= 0
            || !reachable(chrono::Duration::try_hours(self.session_ttl_hours))
        {
            return invalid(format!(
                "sessionTtlHours {} out of range",
                self.session_ttl_hours
            ));
        }
        if self.orphan_threshold_hours < 0
            || !reachable(chrono::Duration::try_hours(self.orphan_threshold_hours))
        {
            return invalid(format!(
                "orphanThresholdHours {} out of range",
                self.orphan_threshold_hours
            ));
        }
        if !reachable(chrono::Duration::try_days(i64::from(self.retry_log_retention_days))) {
            return invalid(format!(
                "retryLogRetentionDays {} out of range",
                self.retry_log_retention_days
            ));
        }
        if self.finalize_lease_ttl_secs <= 0
            || !reachable(chrono::Duration::try_seconds(self.finalize_lease_ttl_secs))
        {
            return invalid(format!(
                "finalizeLeaseTtlSecs {} out of range",
                self.finalize_lease_ttl_secs
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return invalid("cleanupIntervalSecs must be at least 1".into());
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return invalid(format!(
                "retryBaseDelayMs {} exceeds retryMaxDelayMs {}",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            ));
        }
        if self.speed_window == 0 || self.driver_parallelism == 0 {
            return invalid("speedWindow and driverParallelism must be at least 1".into());
        }
        Ok(())
    }

    /// Reads the configuration at `path`, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to load service config, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "service config saved");
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            default_chunk_size: self.chunk_size,
            session_ttl: chrono::Duration::try_hours(self.session_ttl_hours)
                .filter(|ttl| reachable(Some(*ttl)) && *ttl > chrono::Duration::zero())
                .unwrap_or_else(|| chrono::Duration::hours(DEFAULT_SESSION_TTL_HOURS)),
        }
    }

    pub fn finalize_config(&self) -> FinalizeConfig {
        FinalizeConfig {
            lease_ttl: chrono::Duration::try_seconds(self.finalize_lease_ttl_secs)
                .filter(|ttl| reachable(Some(*ttl)) && *ttl > chrono::Duration::zero())
                .unwrap_or_else(|| {
                    chrono::Duration::seconds(chunkline_transfer::finalize::DEFAULT_LEASE_TTL_SECS)
                }),
            assembly_root: self.assembly_root.clone(),
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        let defaults = RecoveryConfig::default();
        RecoveryConfig {
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            capacity: self.load_capacity,
            orphan_threshold: chrono::Duration::try_hours(self.orphan_threshold_hours)
                .filter(|age| reachable(Some(*age)) && *age >= chrono::Duration::zero())
                .unwrap_or(defaults.orphan_threshold),
            retry_log_retention_days: self.retry_log_retention_days,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            parallelism: self.driver_parallelism,
            chunk_size: Some(self.chunk_size),
        }
    }
}

/// Whether `now` plus or minus `span` stays a representable timestamp.
fn reachable(span: Option<chrono::Duration>) -> bool {
    let now = chrono::Utc::now();
    span.is_some_and(|d| now.checked_add_signed(d).is_some() && now.checked_sub_signed(d).is_some())
}
