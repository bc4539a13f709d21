use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fixed 2s spacing between delivery attempts unless configured otherwise.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    #[default]
    FixedDelay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "crate::app::config::serde_helpers")]
    pub base_delay: Duration,
    #[serde(with = "crate::app::config::serde_helpers")]
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: DEFAULT_RETRY_DELAY,
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::FixedDelay,
            jitter: false,
        }
    }
}

/// Bounded retry schedule for one destination.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Delay before the attempt following `attempt`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as u64;
        let step = attempt.saturating_sub(1);
        let delay = match self.config.strategy {
            RetryStrategy::ExponentialBackoff => {
                let multiplier = 2_u64.saturating_pow(step);
                Duration::from_millis(base_ms.saturating_mul(multiplier))
            }
            RetryStrategy::LinearBackoff => {
                Duration::from_millis(base_ms.saturating_mul(u64::from(step) + 1))
            }
            RetryStrategy::FixedDelay => self.config.base_delay,
        };

        let capped = delay.min(self.config.max_delay.max(self.config.base_delay));
        if self.config.jitter {
            Self::apply_jitter(capped)
        } else {
            capped
        }
    }

    // Jitter only ever lengthens the wait, so the configured delay stays a floor.
    fn apply_jitter(delay: Duration) -> Duration {
        let factor = rand::rng().random_range(1.0..1.5);
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
