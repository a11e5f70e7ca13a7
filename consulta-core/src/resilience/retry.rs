//! Retry policy with exponential backoff and bounded jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::PluginConfig;

/// Exponent cap keeping the computed delay finite.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// How often and how patiently a single service is retried.
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound of the random jitter, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay_ms: 500,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy without retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            retries: 0,
            base_delay_ms: 0,
            jitter: 0.0,
        }
    }

    /// Apply the retry fields a plugin configuration sets.
    #[must_use]
    pub fn with_overrides(&self, config: &PluginConfig) -> Self {
        Self {
            retries: config.retries.unwrap_or(self.retries),
            base_delay_ms: config.base_delay_ms.unwrap_or(self.base_delay_ms),
            jitter: config.jitter.unwrap_or(self.jitter),
        }
    }

    /// Backoff before retry `retry` (1 for the second attempt): `base * 2^(retry-1)`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1_u64 << exponent))
    }

    /// Backoff plus a random jitter of up to `jitter` times the backoff.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let backoff = self.backoff(retry);
        let fraction = self.jitter.clamp(0.0, 1.0);
        if fraction <= 0.0 || backoff.is_zero() {
            return backoff;
        }

        let extra = rand::thread_rng().gen_range(0.0..=fraction);
        backoff + backoff.mul_f64(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = RetryPolicy {
            retries: 3,
            base_delay_ms: 100,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            retries: 3,
            base_delay_ms: 1_000,
            jitter: 0.25,
        };

        for _ in 0..50 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(2_000));
            assert!(delay <= Duration::from_millis(2_500));
        }
    }

    #[test]
    fn plugin_config_overrides_fields() {
        let config = PluginConfig {
            retries: Some(0),
            ..PluginConfig::default()
        };

        let policy = RetryPolicy::default().with_overrides(&config);
        assert_eq!(policy.retries, 0);
        assert_eq!(policy.base_delay_ms, 500);
    }
}
