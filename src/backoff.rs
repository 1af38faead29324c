use rand::Rng;
use std::time::Duration;

use crate::config::QueueConfig;

const MAX_EXPONENT: u32 = 16;

/// Capped exponential backoff with proportional jitter.
///
/// The jittered delay is clamped to the cap, so it never exceeds twice the raw
/// delay and successive delays are non-decreasing for any random draws.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    base_ms: u64,
    cap_ms: u64,
    jitter_fraction: f64,
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, cap_ms: u64, jitter_fraction: f64) -> Self {
        Self {
            base_ms,
            cap_ms: cap_ms.max(base_ms),
            jitter_fraction: if jitter_fraction.is_finite() {
                jitter_fraction.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            config.backoff_base_ms,
            config.backoff_cap_ms,
            config.jitter_fraction,
        )
    }

    /// Delay before the next attempt of a mutation rejected `retry_count` times.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen();
        self.delay_with_unit(retry_count, unit)
    }

    /// Deterministic core of [`delay`](Self::delay); `unit` is the jitter draw in `[0, 1)`.
    pub fn delay_with_unit(&self, retry_count: u32, unit: f64) -> Duration {
        let raw = self.raw_delay_ms(retry_count);
        let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 0.0 };
        let jitter = (raw as f64 * self.jitter_fraction * unit) as u64;
        Duration::from_millis(raw.saturating_add(jitter).min(self.cap_ms))
    }

    fn raw_delay_ms(&self, retry_count: u32) -> u64 {
        if retry_count > MAX_EXPONENT {
            return self.cap_ms;
        }
        self.base_ms
            .saturating_mul(1u64 << retry_count)
            .min(self.cap_ms)
    }
}
