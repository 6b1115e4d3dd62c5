//! Bounded exponential backoff with full jitter.

use std::time::Duration;

use rand::Rng;

/// Default attempt budget for node processing functions.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Default backoff cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Retry policy applied around node processing functions.
///
/// Delays grow exponentially from `base_delay` up to `max_delay`; each
/// delay is drawn uniformly from `[0, bound]` (full jitter) so concurrent
/// workers retrying the same backend do not synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    /// Delay bound for the first retry.
    pub base_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(500),
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Creates a policy with the given attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Creates a policy with the given backoff cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Jittered delay before retry number `attempt` (1-based: the delay
    /// after the first failed attempt is `delay(1)`).
    pub fn delay(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as u32;
        let bound = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        if bound.is_zero() {
            return bound;
        }
        let nanos = rand::rng().random_range(0..=bound.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }

    /// Returns whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_bounded_by_cap() {
        let policy = RetryPolicy::default();
        for attempt in 1..=16 {
            assert!(policy.delay(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn attempt_budget_is_inclusive_of_first_attempt() {
        let policy = RetryPolicy::default().with_max_attempts(5);
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
        assert!(!RetryPolicy::none().allows(1));
    }

    #[test]
    fn exponent_growth_saturates() {
        let policy = RetryPolicy::default();
        // Large attempt numbers must not overflow the exponent.
        let _ = policy.delay(10_000);
    }
}
