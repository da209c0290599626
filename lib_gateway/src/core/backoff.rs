//! Delay schedule for the reconnect loop.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with an upper bound and optional proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// The same delay every time, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let min = self.min_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64().max(min);
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = (min * self.multiplier.max(1.0).powi(exp)).min(max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let secs = if jitter > 0.0 && base > 0.0 {
            let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
            (base * factor).min(max)
        } else {
            base
        };
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_geometrically_up_to_the_cap() {
        let policy = BackoffPolicy {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 1.0,
            jitter: 0.5,
        };
        for attempt in 0..50 {
            let d = policy.delay_for(attempt);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500), "{d:?}");
        }
    }

    #[test]
    fn fixed_policy_never_changes() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(250));
        assert_eq!(policy.delay_for(0), policy.delay_for(17));
    }
}
