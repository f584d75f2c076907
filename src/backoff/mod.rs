//! Exponential backoff policy for reconnection scheduling

use std::time::Duration;

use rand::Rng;

/// Exponential backoff descriptor.
///
/// A plain value: `delay` is a pure function of the attempt number and a
/// random draw, so the policy carries no state between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for attempt 0
    pub base_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), jittered with the thread RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    /// Same as [`delay`](Self::delay) with an injected random source.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let raw = self.raw_delay_ms(attempt);

        let final_delay = if self.jitter_factor > 0.0 {
            let jitter = raw * self.jitter_factor * rng.random_range(-1.0..=1.0);
            (raw + jitter).max(0.0)
        } else {
            raw
        };

        Duration::from_millis(final_delay.round() as u64)
    }

    /// Un-jittered delay: `min(base * multiplier^attempt, max)`.
    pub fn expected_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.raw_delay_ms(attempt).round() as u64)
    }

    /// Largest value `delay` can ever return: `max * (1 + jitter)`.
    pub fn upper_bound(&self) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis((max_ms * (1.0 + self.jitter_factor.max(0.0))).round() as u64)
    }

    fn raw_delay_ms(&self, attempt: u32) -> f64 {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        // powf overflows to infinity for huge attempts; min() caps it
        let grown = base_ms * self.multiplier.powf(attempt as f64);
        if grown.is_nan() {
            return max_ms;
        }
        grown.min(max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(jitter_factor: f64) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            jitter_factor,
        }
    }

    #[test]
    fn test_backoff_without_jitter_doubles() {
        let policy = policy(0.0);

        assert_eq!(policy.delay(0), Duration::from_millis(1000));
        assert_eq!(policy.delay(1), Duration::from_millis(2000));
        assert_eq!(policy.delay(2), Duration::from_millis(4000));
        assert_eq!(policy.delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = policy(0.0);

        assert_eq!(policy.delay(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay(60), Duration::from_millis(10_000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn test_backoff_never_exceeds_upper_bound() {
        let policy = policy(0.5);
        let bound = policy.upper_bound();
        assert_eq!(bound, Duration::from_millis(15_000));

        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..200 {
            let delay = policy.delay_with(attempt % 40, &mut rng);
            assert!(delay <= bound, "attempt {} produced {:?}", attempt, delay);
        }
    }

    #[test]
    fn test_jitter_stays_near_expected_curve() {
        let policy = policy(0.1);
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 0..6 {
            let expected = policy.expected_delay(attempt).as_millis() as f64;
            let delay = policy.delay_with(attempt, &mut rng).as_millis() as f64;
            assert!(delay >= expected * 0.9 - 1.0);
            assert!(delay <= expected * 1.1 + 1.0);
        }
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let policy = policy(0.3);
        let a = policy.delay_with(2, &mut StdRng::seed_from_u64(99));
        let b = policy.delay_with(2, &mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn test_full_jitter_never_goes_negative() {
        let policy = policy(1.0);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let delay = policy.delay_with(0, &mut rng);
            assert!(delay <= Duration::from_millis(2000));
        }
    }
}
