//! Retry policy shared by the monitor and the bridge loops.

use std::time::Duration;

/// Exponential backoff with a cap and a consecutive-failure limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay used when there is no failure streak.
    pub base_interval: Duration,
    /// Upper bound for any computed delay.
    pub max_backoff: Duration,
    /// Number of consecutive failures after which the policy is exhausted.
    pub max_consecutive_failures: u32,
}

impl RetryPolicy {
    /// Creates a new policy.
    pub fn new(base_interval: Duration, max_backoff: Duration, max_consecutive_failures: u32) -> Self {
        Self {
            base_interval,
            max_backoff,
            max_consecutive_failures,
        }
    }

    /// Returns the delay to wait after `consecutive_failures` failures in a row.
    ///
    /// The delay doubles with every failure, never exceeds `max_backoff`, and
    /// is pinned at `max_backoff` once the policy is exhausted.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.base_interval.min(self.max_backoff);
        }
        if self.is_exhausted(consecutive_failures) {
            return self.max_backoff;
        }

        let factor = 2u32.saturating_pow(consecutive_failures);
        self.base_interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Returns true once the failure streak reaches the limit.
    pub fn is_exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.max_consecutive_failures
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 10);

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(9), Duration::from_secs(10));
    }

    #[test]
    fn test_exhausted_uses_max_backoff() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(300), 5);

        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert_eq!(policy.delay_for(5), Duration::from_secs(300));
        assert_eq!(policy.delay_for(50), Duration::from_secs(300));
    }

    #[test]
    fn test_huge_streak_does_not_overflow() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), u32::MAX);
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }
}
