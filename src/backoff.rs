use std::time::Duration;

use crate::config::DispatcherConfig;

/// Lower/upper bound of the random multiplier applied to each delay.
const JITTER_LOW: f64 = 0.9;
const JITTER_HIGH: f64 = 1.1;

/// What to do with an event whose handling attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `PENDING`, eligible again after `delay`.
    Retry { retries: u32, delay: Duration },
    /// Retry budget exhausted.
    Dead { retries: u32 },
}

/// Exponential backoff with a cap and multiplicative jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(config.max_retries, config.backoff_base, config.backoff_cap)
    }

    /// Decide the fate of an event that had `prior_retries` failures before
    /// the one just observed.
    pub fn decide(&self, prior_retries: u32) -> RetryDecision {
        let retries = prior_retries.saturating_add(1);
        if retries >= self.max_retries {
            RetryDecision::Dead { retries }
        } else {
            RetryDecision::Retry {
                retries,
                delay: self.delay_for(prior_retries),
            }
        }
    }

    /// `min(cap, base * 2^prior_retries)` before jitter.
    pub fn nominal_delay(&self, prior_retries: u32) -> Duration {
        let factor = 1u32.checked_shl(prior_retries).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Jittered delay, never shorter than one millisecond.
    pub fn delay_for(&self, prior_retries: u32) -> Duration {
        let nominal = self.nominal_delay(prior_retries);
        let multiplier = JITTER_LOW + fastrand::f64() * (JITTER_HIGH - JITTER_LOW);
        nominal.mul_f64(multiplier).max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_secs(60), Duration::from_secs(3_600))
    }

    #[test]
    fn nominal_delay_doubles_until_the_cap() {
        let p = policy(8);
        assert_eq!(p.nominal_delay(0), Duration::from_secs(60));
        assert_eq!(p.nominal_delay(1), Duration::from_secs(120));
        assert_eq!(p.nominal_delay(5), Duration::from_secs(1_920));
        assert_eq!(p.nominal_delay(6), Duration::from_secs(3_600));
        assert_eq!(p.nominal_delay(40), Duration::from_secs(3_600));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let p = policy(8);
        for retries in 0..8 {
            let nominal = p.nominal_delay(retries).as_secs_f64();
            for _ in 0..50 {
                let delay = p.delay_for(retries).as_secs_f64();
                assert!(delay >= nominal * 0.9 - 1e-6, "{delay} < {nominal}");
                assert!(delay <= nominal * 1.1 + 1e-6, "{delay} > {nominal}");
            }
        }
    }

    #[test]
    fn dead_once_retries_reach_the_budget() {
        let p = policy(3);
        assert!(matches!(p.decide(0), RetryDecision::Retry { retries: 1, .. }));
        assert!(matches!(p.decide(1), RetryDecision::Retry { retries: 2, .. }));
        assert_eq!(p.decide(2), RetryDecision::Dead { retries: 3 });
        assert_eq!(policy(1).decide(0), RetryDecision::Dead { retries: 1 });
    }

    #[test]
    fn zero_base_still_schedules_in_the_future() {
        let p = RetryPolicy::new(5, Duration::ZERO, Duration::ZERO);
        assert!(p.delay_for(0) >= Duration::from_millis(1));
    }
}
