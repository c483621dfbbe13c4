//! Reconnection backoff policy.

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;

/// Immutable backoff parameters. The attempt counter lives in the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff_factor: f64,
    /// Uniform multiplier applied to each delay, e.g. `0.8..=1.2`.
    pub jitter_range: RangeInclusive<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
            backoff_factor: 2.0,
            jitter_range: 0.8..=1.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (0-based), without jitter:
    /// `min(max_delay, initial_delay * backoff_factor^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        // powi overflows to inf for large attempts; min() clamps that too.
        Duration::from_secs_f64(raw.min(max).max(0.0))
    }

    /// Jittered delay before attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let (lo, hi) = (*self.jitter_range.start(), *self.jitter_range.end());
        let factor = if lo < hi {
            rand::rng().random_range(lo..=hi)
        } else {
            lo
        };
        self.base_delay(attempt).mul_f64(factor.max(0.0))
    }

    /// Whether `attempts` consecutive failures use up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_range = 1.0..=1.0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(4), Duration::from_secs(16));
        assert_eq!(policy.base_delay(5), Duration::from_secs(30));
        assert_eq!(policy.base_delay(500), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay(2);
            assert!(d >= Duration::from_millis(3200), "{d:?}");
            assert!(d <= Duration::from_millis(4800), "{d:?}");
        }
    }

    #[test]
    fn without_jitter_is_exact() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn exhaustion() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));

        let forever = RetryPolicy {
            max_attempts: None,
            ..Default::default()
        };
        assert!(!forever.exhausted(u32::MAX));
    }

    proptest! {
        #[test]
        fn base_delay_is_non_decreasing(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            factor in 1.0f64..4.0,
            attempt in 0u32..200,
        ) {
            let policy = RetryPolicy {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                max_attempts: None,
                backoff_factor: factor,
                jitter_range: 1.0..=1.0,
            };
            let a = policy.base_delay(attempt);
            let b = policy.base_delay(attempt + 1);
            prop_assert!(a <= b);
            prop_assert!(b <= policy.max_delay);
        }
    }
}
