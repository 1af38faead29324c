use serde::{Deserialize, Serialize};

use crate::envelope::MAX_RECORD_BYTES;
use crate::queue::QueueError;

/// Retry, backoff and capacity policy shared by every mutation kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Rejections tolerated before a mutation is dead-lettered.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the raw delay.
    pub jitter_fraction: f64,
    /// Shared by pending mutations and retained dead letters.
    pub max_entries: usize,
    /// Dead letters kept for inspection. The oldest are evicted beyond this.
    pub max_dead_letters: usize,
    /// Largest encoded record the queue will write.
    pub max_record_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            jitter_fraction: 0.2,
            max_entries: 10_000,
            max_dead_letters: 1_000,
            max_record_bytes: MAX_RECORD_BYTES,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_retries == 0 {
            return Err(QueueError::InvalidConfig("max_retries must be >= 1".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "backoff_base_ms must be > 0".into(),
            ));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(QueueError::InvalidConfig(format!(
                "backoff_cap_ms ({}) must be >= backoff_base_ms ({})",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        if !self.jitter_fraction.is_finite() || !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(QueueError::InvalidConfig(format!(
                "jitter_fraction must be within 0..=1, got {}",
                self.jitter_fraction
            )));
        }
        if self.max_entries == 0 {
            return Err(QueueError::InvalidConfig("max_entries must be > 0".into()));
        }
        if self.max_dead_letters == 0 || self.max_dead_letters >= self.max_entries {
            return Err(QueueError::InvalidConfig(format!(
                "max_dead_letters ({}) must be within 1..max_entries ({})",
                self.max_dead_letters, self.max_entries
            )));
        }
        if self.max_record_bytes == 0 || self.max_record_bytes > MAX_RECORD_BYTES {
            return Err(QueueError::InvalidConfig(format!(
                "max_record_bytes must be within 1..={MAX_RECORD_BYTES}, got {}",
                self.max_record_bytes
            )));
        }
        Ok(())
    }

    /// Parse a host-supplied JSON policy document. Missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, QueueError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| QueueError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
