//! Exponential backoff with multiplicative jitter.

use std::time::Duration;

/// Controls the retry delay ladder.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// First-attempt delay, e.g. 500ms
    pub base: Duration,
    /// Cap applied before jitter, e.g. 30s
    pub max: Duration,
    /// Half-width of the jitter band, e.g. 0.20 => ±20%
    pub jitter: f64,
}

impl BackoffConfig {
    /// Returns the delay for a given attempt (attempts start at 1).
    pub fn next(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.jittered(self.base);
        }

        // base * 2^(attempt-1), capped at max
        let exponent = (attempt - 1).min(63);
        let delay = (self.base.as_secs_f64() * 2f64.powi(exponent as i32))
            .min(self.max.as_secs_f64());
        self.jittered(Duration::from_secs_f64(delay))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if delay.is_zero() {
            return Duration::ZERO;
        }
        if self.jitter <= 0.0 {
            return delay;
        }
        // factor in [1-j, 1+j]
        let factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        delay.mul_f64(factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, max_ms: u64, jitter: f64) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            jitter,
        }
    }

    #[test]
    fn test_first_attempt_is_base_without_jitter() {
        let backoff = config(500, 30_000, 0.0);
        assert_eq!(backoff.next(1), Duration::from_millis(500));
    }

    #[test]
    fn test_doubles_per_attempt() {
        let backoff = config(100, 30_000, 0.0);
        assert_eq!(backoff.next(2), Duration::from_millis(200));
        assert_eq!(backoff.next(3), Duration::from_millis(400));
        assert_eq!(backoff.next(4), Duration::from_millis(800));
    }

    #[test]
    fn test_caps_at_max() {
        let backoff = config(100, 300, 0.0);
        assert_eq!(backoff.next(3), Duration::from_millis(300));
        assert_eq!(backoff.next(10), Duration::from_millis(300));
        assert_eq!(backoff.next(40), Duration::from_millis(300));
    }

    #[test]
    fn test_monotone_without_jitter() {
        let backoff = config(50, 10_000, 0.0);
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = backoff.next(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let backoff = config(1_000, 30_000, 0.2);
        let low = Duration::from_millis(800);
        let high = Duration::from_millis(1_200);
        for _ in 0..200 {
            let delay = backoff.next(1);
            assert!(delay >= low && delay <= high, "delay {delay:?} out of band");
        }
    }

    #[test]
    fn test_jitter_bounded_by_max() {
        let backoff = config(1_000, 4_000, 0.25);
        let bound = Duration::from_millis(5_000);
        for attempt in 1..=30 {
            assert!(backoff.next(attempt) <= bound);
        }
    }

    #[test]
    fn test_zero_base_yields_zero() {
        let backoff = config(0, 30_000, 0.2);
        assert_eq!(backoff.next(1), Duration::ZERO);
        assert_eq!(backoff.next(5), Duration::ZERO);
    }
}
