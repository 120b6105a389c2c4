//! Exponential backoff between attempts.

use std::time::Duration;

/// Delay before attempt `n + 1` is `min(base * factor^n, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10 * 60),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    /// Delay after `retry_count` failed executions.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let multiplier = self.factor.max(1).checked_pow(retry_count.min(32));
        multiplier
            .and_then(|m| self.base.checked_mul(m))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_geometrically() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(60));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_millis(3200));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_factor_one_is_constant() {
        let policy = RetryPolicy {
            base: Duration::from_millis(250),
            max: Duration::from_secs(5),
            factor: 1,
        };
        assert_eq!(policy.delay(0), policy.delay(10));
    }
}
