//! Sync engine configuration.
//!
//! # Responsibility
//! - Hold tunables for batching, timeouts, backoff and network debounce.
//! - Load them from JSON with per-field defaults and validate them.
//!
//! # Invariants
//! - A config returned by `from_json_str`/`from_json_file` has passed
//!   `validate()`.

use crate::model::change::{validate_device_id, ValidationError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_BACKOFF_JITTER_RATIO: f64 = 0.2;
pub const DEFAULT_NETWORK_DWELL_MS: u64 = 2_000;
pub const MAX_BATCH_SIZE: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Stable identifier stamped on every change record from this device.
    pub device_id: String,
    /// Maximum records per transport call.
    pub batch_size: usize,
    /// Per-batch transport timeout; elapsing counts as a transport failure.
    pub batch_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub backoff_jitter_ratio: f64,
    /// Minimum time a connectivity change must persist before it is reported.
    pub network_dwell_ms: u64,
    /// Fixes the jitter sequence; `None` seeds from OS entropy.
    pub jitter_seed: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: "local".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            backoff_jitter_ratio: DEFAULT_BACKOFF_JITTER_RATIO,
            network_dwell_ms: DEFAULT_NETWORK_DWELL_MS,
            jitter_seed: None,
        }
    }
}

impl SyncConfig {
    /// Default config for one device.
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|err| ValidationError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ValidationError::InvalidConfig(format!(
                "failed to read config `{}`: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_device_id(&self.device_id)?;
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ValidationError::InvalidConfig(format!(
                "batch_size must be within 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.batch_timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig(
                "batch_timeout_ms must be positive".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            return Err(ValidationError::InvalidConfig(format!(
                "backoff requires 0 < base ({}) <= max ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter_ratio) {
            return Err(ValidationError::InvalidConfig(format!(
                "backoff_jitter_ratio must be within 0.0..=1.0, got {}",
                self.backoff_jitter_ratio
            )));
        }
        Ok(())
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}
