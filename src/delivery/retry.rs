//! Exponential backoff schedule.

use crate::config::DeliveryConfig;
use std::time::Duration;

/// Retry configuration for synchronous delivery attempts.
///
/// ## Schedule:
/// The first attempt runs immediately. Retry `n` (1-based) waits
/// `min(base_delay * multiplier^(n-1), max_delay)` before running.
///
/// With `base_delay=1s, multiplier=2, max_delay=10s, max_retries=3`
/// the waits are 1s, 2s, 4s.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
            max_retries: 3,
        }
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_retries: config.max_retries,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based). Attempt 0 is the initial call and never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// The full list of waits a failing operation goes through.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries).map(|n| self.delay_for_attempt(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000)
            ]
        );
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy { max_retries: 8, ..RetryPolicy::default() };
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000));
        assert!(policy.schedule().iter().all(|d| *d <= policy.max_delay));
        // Huge attempt numbers saturate instead of overflowing
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(10000));
    }
}
