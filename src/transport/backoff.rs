//! Reconnect backoff for the agent connection

use std::time::Duration;

/// Reconnect policy for the streaming connection
///
/// Delays double from `base_delay` and saturate at `max_delay`. The retry
/// counter itself stops growing at `max_retry`, so attempts never run out;
/// only the delay is bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Highest value the retry counter reaches
    pub max_retry: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(32),
            max_retry: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnecting after `retry` consecutive failures
    ///
    /// `min(max_delay, base_delay * 2^retry)`: 2, 4, 8, 16, 32, 32, ... seconds
    /// with the defaults.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(self.max_retry));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Counter value after one more failure
    #[must_use]
    pub fn next_retry(&self, retry: u32) -> u32 {
        retry.saturating_add(1).min(self.max_retry)
    }
}
