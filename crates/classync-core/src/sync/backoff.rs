//! Retry backoff for failed uploads

use std::time::Duration;

use crate::config::Config;

/// Exponential backoff with a ceiling and an attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_secs(config.backoff_cap_secs),
            config.max_attempts.max(1),
        )
    }

    /// Delay before the next try after `attempts` consecutive failures
    ///
    /// `min(cap, base * 2^(attempts - 1))`
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempts - 1);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Whether a retryable failure at this attempt count is demoted to failed
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
