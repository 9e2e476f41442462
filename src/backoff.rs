//! Exponential backoff with jitter, honoring server-supplied retry hints.

use rand::Rng;
use std::time::Duration;

/// Tunables for [`BackoffPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base_ms: 1_000, max_ms: 30_000, max_attempts: 5 }
    }
}

/// Computes next-attempt delays from an attempt count and an optional
/// server-supplied hint (`Retry-After`).
#[derive(Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// `attempts < max_attempts`.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.config.max_attempts
    }

    /// Delay before the next attempt, drawing jitter from the thread-local
    /// RNG. Production callers want this one; tests that need a
    /// reproducible delay should use [`Self::compute_delay_with_rng`].
    pub fn compute_delay(&self, attempts: i64, retry_after: Option<Duration>) -> Duration {
        self.compute_delay_with_rng(attempts, retry_after, &mut rand::thread_rng())
    }

    /// Same as [`Self::compute_delay`] but draws jitter from a caller-supplied
    /// RNG, so a seeded generator makes the resulting delay deterministic.
    /// If `retry_after` is present it wins outright (capped to `max_ms`);
    /// otherwise the delay is exponential in `attempts`, clamped, then
    /// jittered by a uniform factor in [0.5, 1.5].
    pub fn compute_delay_with_rng<R: Rng + ?Sized>(
        &self,
        attempts: i64,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(Duration::from_millis(self.config.max_ms));
        }

        let attempts = attempts.max(1) as u32;
        let raw_ms = self.raw_delay_ms(attempts);

        let jitter: f64 = rng.gen_range(0.5..=1.5);
        let jittered_ms = (raw_ms as f64 * jitter).round() as u64;
        Duration::from_millis(jittered_ms)
    }

    /// Exponential delay before jitter, with the exponent capped so
    /// `2^exponent` can never overflow `max_ms`.
    fn raw_delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1);
        let max_useful_exponent = if self.config.base_ms == 0 {
            63
        } else {
            (self.config.max_ms / self.config.base_ms.max(1)).checked_ilog2().unwrap_or(0) + 1
        };
        let capped_exponent = exponent.min(max_useful_exponent.min(62));
        let multiplier = 1u64.checked_shl(capped_exponent).unwrap_or(u64::MAX);
        self.config.base_ms.saturating_mul(multiplier).min(self.config.max_ms)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = BackoffPolicy::new(BackoffConfig { max_attempts: 3, ..Default::default() });
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn retry_after_hint_wins_and_is_capped() {
        let policy = BackoffPolicy::new(BackoffConfig {
            base_ms: 1_000,
            max_ms: 30_000,
            max_attempts: 5,
        });
        let delay = policy.compute_delay(1, Some(Duration::from_secs(60)));
        assert_eq!(delay, Duration::from_millis(30_000));

        let delay = policy.compute_delay(1, Some(Duration::from_secs(5)));
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn delay_without_hint_is_bounded() {
        let policy = BackoffPolicy::default();
        for attempts in 0..10 {
            let delay = policy.compute_delay(attempts, None);
            assert!(delay <= Duration::from_millis(30_000 * 3 / 2));
        }
    }

    #[test]
    fn attempts_le_zero_treated_as_one() {
        let policy = BackoffPolicy::new(BackoffConfig {
            base_ms: 1_000,
            max_ms: 30_000,
            max_attempts: 5,
        });
        for attempts in [-5, 0, 1] {
            let delay = policy.compute_delay(attempts, None);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn exponent_does_not_overflow_and_clamps_to_max() {
        let policy = BackoffPolicy::new(BackoffConfig {
            base_ms: 1_000,
            max_ms: 30_000,
            max_attempts: 100,
        });
        let delay = policy.compute_delay(64, None);
        assert!(delay <= Duration::from_millis(45_000));
        assert!(delay >= Duration::from_millis(15_000));
    }

    #[test]
    fn seeded_rng_makes_the_jittered_delay_reproducible() {
        let policy = BackoffPolicy::new(BackoffConfig { base_ms: 1_000, max_ms: 30_000, max_attempts: 5 });

        let mut rng_a = StdRng::seed_from_u64(7);
        let delay_a = policy.compute_delay_with_rng(3, None, &mut rng_a);

        let mut rng_b = StdRng::seed_from_u64(7);
        let delay_b = policy.compute_delay_with_rng(3, None, &mut rng_b);

        assert_eq!(delay_a, delay_b);
        assert!(delay_a >= Duration::from_millis(2_000) && delay_a <= Duration::from_millis(6_000));
    }

    #[test]
    fn exponential_growth_before_clamp() {
        let policy = BackoffPolicy::new(BackoffConfig {
            base_ms: 1_000,
            max_ms: 30_000,
            max_attempts: 10,
        });
        assert_eq!(policy.raw_delay_ms(1), 1_000);
        assert_eq!(policy.raw_delay_ms(2), 2_000);
        assert_eq!(policy.raw_delay_ms(3), 4_000);
        assert_eq!(policy.raw_delay_ms(6), 30_000);
    }
}
