//! Retry delay calculation.
//!
//! Delays grow exponentially with the retry attempt and are capped:
//! `min(2^attempt * base, max)`. With the defaults (one minute base, 24 hour
//! cap) attempts 1, 2, 3 wait 2, 4 and 8 minutes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default base delay (one minute).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

/// Default maximum delay (24 hours).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff with a cap and optional additive jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffCalculator {
    /// Delay multiplied by `2^attempt`.
    #[serde(with = "serde_millis")]
    pub base: Duration,

    /// Upper bound on any computed delay, jitter included.
    #[serde(with = "serde_millis")]
    pub max: Duration,

    /// Fraction of the delay added as random jitter (0.0 disables it).
    pub jitter_ratio: f64,
}

impl BackoffCalculator {
    /// Create a calculator without jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_ratio: 0.0,
        }
    }

    /// Builder: set the jitter ratio, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Deterministic delay for a retry attempt (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max)
    }

    /// Delay for a retry attempt with `rand * jitter_ratio * delay` added.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let jitter = delay.mul_f64(rand::random::<f64>() * self.jitter_ratio);
        delay.saturating_add(jitter).min(self.max)
    }

    /// When the given retry attempt becomes due, counted from `from`.
    pub fn next_retry_at(&self, attempt: u32, from: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.jittered_delay(attempt))
            .unwrap_or(chrono::Duration::MAX);
        from.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Serde helper for Duration serialization as milliseconds.
pub(crate) mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
