//! Deferral policy for steps waiting on slow backend operations.
//!
//! A deferred step is re-dispatched with an exponentially growing delay. After
//! `max_attempts` consecutive deferrals the run is dead-lettered instead of
//! polling forever.

use crate::config::DeferralConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferralDecision {
    /// Re-dispatch the same step after `delay`, carrying `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Give up; the run is dead-lettered
    DeadLetter { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct DeferralPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for DeferralPolicy {
    fn default() -> Self {
        Self::from(&DeferralConfig::default())
    }
}

impl From<&DeferralConfig> for DeferralPolicy {
    fn from(config: &DeferralConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.base_delay_seconds),
            multiplier: config.multiplier,
            max_delay: Duration::from_secs(config.max_delay_seconds),
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

impl DeferralPolicy {
    /// Decide what to do with a step that has already been deferred
    /// `previous_attempts` times and is not yet actionable again.
    pub fn decide(&self, previous_attempts: u32) -> DeferralDecision {
        let attempt = previous_attempts.saturating_add(1);
        if attempt > self.max_attempts {
            return DeferralDecision::DeadLetter {
                attempts: previous_attempts,
            };
        }
        DeferralDecision::Retry {
            attempt,
            delay: self.delay_for(attempt),
        }
    }

    /// Delay before the `attempt`-th (1-based) retry
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let delay_secs = (self.base_delay.as_secs_f64() * factor).min(max_secs);

        let jittered = if self.jitter_factor > 0.0 {
            let jitter = fastrand::f64() * self.jitter_factor;
            (delay_secs * (1.0 + jitter)).min(max_secs)
        } else {
            delay_secs
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DeferralPolicy {
        DeferralPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_delay: Duration::from_secs(100),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(100));
        assert_eq!(policy.delay_for(40), Duration::from_secs(100));
    }

    #[test]
    fn test_dead_letter_after_max_attempts() {
        let policy = policy();
        assert_eq!(
            policy.decide(0),
            DeferralDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(30)
            }
        );
        assert!(matches!(policy.decide(3), DeferralDecision::Retry { attempt: 4, .. }));
        assert_eq!(policy.decide(4), DeferralDecision::DeadLetter { attempts: 4 });
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = DeferralPolicy {
            jitter_factor: 0.5,
            max_delay: Duration::from_secs(1_000),
            ..policy()
        };
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(30));
            assert!(delay <= Duration::from_secs(45));
        }
    }
}
