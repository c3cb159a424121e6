//! Launch retry policy

use std::time::Duration;

/// How failed validator launches are retried.
///
/// Attempts are numbered from 1. The delay before attempt `n + 1` is
/// `delay * backoff_factor^(n - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, at most `max_attempts` times in total.
    pub fn immediate(max_attempts: Option<u32>) -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let millis = self.delay.as_millis() as f64 * factor;

        let cap = self.max_delay.max(self.delay);
        if !millis.is_finite() || millis >= cap.as_millis() as f64 {
            cap
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// Whether another attempt may follow failed attempt `attempt`.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}
