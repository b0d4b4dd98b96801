//! Retry delay between reconciliation cycles.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff on top of the flat reconcile interval.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after a successful cycle, and the base for growth.
    pub base: Duration,

    /// Maximum delay before jitter.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0), added on top of the capped delay.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: 0.25,
        }
    }

    /// Delay before the next cycle given the number of consecutive failed
    /// cycles. Zero failures means the flat interval with no jitter.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.base;
        }

        let exponent = (consecutive_failures - 1).min(16) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(0.0..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(600))
    }

    #[test]
    fn test_no_failures_is_flat_interval() {
        assert_eq!(policy().delay(0), Duration::from_secs(60));
    }

    #[test]
    fn test_growth_is_bounded() {
        let policy = policy();
        for (failures, floor) in [(1, 60), (2, 120), (3, 240), (4, 480), (5, 600), (40, 600)] {
            let delay = policy.delay(failures);
            let floor = Duration::from_secs(floor);
            assert!(delay >= floor, "{failures}: {delay:?} < {floor:?}");
            assert!(
                delay <= floor.mul_f64(1.25),
                "{failures}: {delay:?} above jitter bound"
            );
        }
    }

    #[test]
    fn test_max_below_base_is_raised() {
        let policy = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(1));
        assert_eq!(policy.max, Duration::from_secs(60));
    }

    #[test]
    fn test_without_jitter_is_exact() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..policy()
        };
        assert_eq!(policy.delay(2), Duration::from_secs(120));
    }
}
