use std::time::Duration;

use crate::config::RetrySection;

/// Bounded exponential backoff applied through queue redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrySection::default())
    }
}

impl RetryPolicy {
    pub fn from_config(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: Duration::from_secs(section.base_delay_seconds),
            max_delay: Duration::from_secs(section.max_delay_seconds),
        }
    }

    /// Delay before the attempt that follows attempt number `attempt` (1-based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// True once a job has been claimed more often than the budget allows.
    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made > self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.compute_delay(1), Duration::from_secs(2));
        assert_eq!(policy.compute_delay(2), Duration::from_secs(4));
        assert_eq!(policy.compute_delay(3), Duration::from_secs(8));
        assert_eq!(policy.compute_delay(10), Duration::from_secs(60));
        assert_eq!(policy.compute_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));

        let zero = RetryPolicy::from_config(&RetrySection {
            max_attempts: 0,
            ..RetrySection::default()
        });
        assert_eq!(zero.max_attempts, 1);
    }
}
