//! Reconnection policies\
//! To decide how long to wait before the next attempt at filling an empty
//! slot in a connection pool, the pool uses any object implementing
//! the `ReconnectionPolicy` trait.

use std::fmt;
use std::time::Duration;

use rand::Rng as _;

/// Specifies a policy of waiting between consecutive connection attempts
/// filling the same pool slot.
pub trait ReconnectionPolicy: fmt::Debug + Send + Sync {
    /// Called for each new chain of connection attempts. The returned
    /// schedule lives for as long as attempts for that slot keep failing,
    /// so the delays it produces can keep growing across attempts.
    fn new_reconnection_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// Produces the delays for one chain of connection attempts.
/// Distinct schedules maintain independent state.
pub trait ReconnectionSchedule: Send {
    /// Returns the delay to wait before the next attempt.
    fn next_delay(&mut self) -> Duration;
}

/// A reconnection policy which always waits the same amount of time.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    base_delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_reconnection_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantReconnectionSchedule {
            delay: self.base_delay,
        })
    }
}

struct ConstantReconnectionSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantReconnectionSchedule {
    fn next_delay(&mut self) -> Duration {
        jittered(self.delay)
    }
}

/// A reconnection policy which doubles the delay on every attempt, up to
/// a configured ceiling.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_reconnection_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialReconnectionSchedule {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            attempt: 0,
        })
    }
}

struct ExponentialReconnectionSchedule {
    base_delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl ReconnectionSchedule for ExponentialReconnectionSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self
            .base_delay
            .checked_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        self.attempt = self.attempt.saturating_add(1);
        jittered(delay)
    }
}

// Spreads out reconnection attempts of pools which lost their connections
// at the same instant (e.g. on a node restart).
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::rng().random_range(0.85..=1.15))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::utils::test_utils::setup_tracing;

    use super::{
        ConstantReconnectionPolicy, ExponentialReconnectionPolicy, ReconnectionPolicy,
    };

    fn assert_jittered_around(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected.mul_f64(0.85) && actual <= expected.mul_f64(1.15),
            "delay {actual:?} outside jitter window of {expected:?}",
        );
    }

    #[test]
    fn test_constant_policy_delays() {
        setup_tracing();
        let policy = ConstantReconnectionPolicy::new(Duration::from_millis(250));
        let mut schedule = policy.new_reconnection_schedule();
        for _ in 0..16 {
            assert_jittered_around(schedule.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_exponential_policy_grows_and_caps() {
        setup_tracing();
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
        let mut schedule = policy.new_reconnection_schedule();

        for expected_secs in [2u64, 4, 8, 16, 32, 60, 60, 60] {
            assert_jittered_around(schedule.next_delay(), Duration::from_secs(expected_secs));
        }

        // Way past the point where the doubling would overflow.
        let mut schedule = policy.new_reconnection_schedule();
        for _ in 0..100 {
            let delay = schedule.next_delay();
            assert!(delay <= Duration::from_secs(60).mul_f64(1.15));
        }
    }

    #[test]
    fn test_schedules_are_independent() {
        setup_tracing();
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
        let mut first = policy.new_reconnection_schedule();
        for _ in 0..5 {
            first.next_delay();
        }
        // A fresh schedule starts over from the base delay.
        let mut second = policy.new_reconnection_schedule();
        assert_jittered_around(second.next_delay(), Duration::from_secs(2));
    }
}
