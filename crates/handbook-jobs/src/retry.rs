//! Back-off between attempts of a transiently failing job.

use std::time::Duration;

use rand::Rng;

use handbook_core::defaults::{JOB_RETRY_BASE_DELAY_MS, JOB_RETRY_MAX_DELAY_MS};

/// Exponential back-off: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Spread delays by up to 10% so requeued jobs do not line up.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(JOB_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(JOB_RETRY_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the attempt after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        delay.mul_f64(factor).min(self.max_delay)
    }
}
