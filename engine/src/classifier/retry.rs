//! Retry policy for external completion calls
//!
//! Exponential backoff with jitter. The policy is a plain value object so
//! call sites and tests can reason about delays without touching the clock.

use std::time::Duration;

use crate::config::ClassifierConfig;

/// Backoff schedule for transient completion failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter in [0, 1]; 0.2 means +/-20% of the computed delay.
    pub jitter_factor: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay before retrying the attempt numbered `attempt` (0-based, so the
    /// delay after the first failure uses attempt 0).
    ///
    /// `random` must be uniform in [0, 1); the caller supplies it so tests can
    /// pin the jitter.
    pub fn delay_for_attempt_with_random(&self, attempt: u32, random: f64) -> Duration {
        let exponential_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(32));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis()) as f64;

        // Map [0,1) to [-1,1) and scale by the jitter factor
        let jitter = (random * 2.0 - 1.0) * self.jitter_factor;
        let with_jitter = (capped_ms * (1.0 + jitter)).max(0.0);

        Duration::from_millis(with_jitter as u64)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with_random(attempt, rand::random::<f64>())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter_factor: 0.2,
        }
    }
}
