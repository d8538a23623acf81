//! Reconnect backoff shared by the feed and bus clients

use std::time::Duration;

use serde::Deserialize;

/// Exponential backoff configuration for reconnection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt. Default: 1s.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff with jitter.
    ///
    /// `delay = min(min(initial * 2^attempt, max) * jitter, max)` where the
    /// jitter factor stays within 0.75..=1.25. The jitter is seeded from the
    /// attempt number so the sequence is reproducible.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let max = self.max_delay.as_secs_f64();
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        let capped = base.min(max);

        let jitter_factor = 1.0 + 0.25 * (attempt as f64 * 7.3).sin();
        let with_jitter = (capped * jitter_factor).clamp(0.0, max);

        Duration::from_secs_f64(with_jitter)
    }
}
