//! Reconnection backoff with jitter.
//!
//! Exponential backoff (base, 2·base, 4·base, ...) capped at a maximum, plus a uniformly
//! distributed jitter of 0–20 % of the capped delay so many clients dropped by the same outage
//! do not reconnect in lockstep. The attempt budget turns "retry forever" into the terminal,
//! observable degraded state.

use crate::config::StreamConfig;
use rand::Rng;
use std::time::Duration;

/// Upper bound of the jitter, as a fraction of the capped delay.
pub const MAX_JITTER_FRACTION: f64 = 0.2;

/// Backoff parameters for scheduling reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry (doubles each attempt)
    pub base_delay: Duration,
    /// Cap on the un-jittered delay
    pub max_delay: Duration,
    /// Number of retries allowed before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for ReconnectPolicy {
    fn from(config: &StreamConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Jittered delay to wait before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, self.max_delay, attempt)
    }

    /// True once `attempt` retries have been used up.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        is_exhausted(attempt, self.max_attempts)
    }
}

/// `min(base * 2^attempt, max)` without jitter. Saturates instead of overflowing.
pub fn capped_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// [`capped_delay`] plus a uniformly random jitter in `[0, 0.2 * delay]`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let jitter_fraction = rand::rng().random_range(0.0..=MAX_JITTER_FRACTION);
    backoff_delay_with_jitter(base, max, attempt, jitter_fraction)
}

/// Deterministic variant of [`backoff_delay`]: `jitter_fraction` is clamped to `[0, 0.2]`.
pub fn backoff_delay_with_jitter(
    base: Duration,
    max: Duration,
    attempt: u32,
    jitter_fraction: f64,
) -> Duration {
    let delay = capped_delay(base, max, attempt);
    let fraction = if jitter_fraction.is_finite() {
        jitter_fraction.clamp(0.0, MAX_JITTER_FRACTION)
    } else {
        0.0
    };
    delay + delay.mul_f64(fraction)
}

/// Whether `attempt` retries have consumed a budget of `max_attempts`.
pub fn is_exhausted(attempt: u32, max_attempts: u32) -> bool {
    attempt >= max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(2_000);
    const CAP: Duration = Duration::from_millis(30_000);

    #[test]
    fn test_capped_delay_doubles_until_cap() {
        let expected = [2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
        for (attempt, expected_ms) in expected.into_iter().enumerate() {
            assert_eq!(
                capped_delay(BASE, CAP, attempt as u32),
                Duration::from_millis(expected_ms),
                "attempt {} failed",
                attempt
            );
        }
    }

    #[test]
    fn test_backoff_delay_within_jitter_bounds() {
        // 2000, 4000, 8000ms un-jittered, each inflated by 0-20%
        for attempt in 0..3 {
            let floor = capped_delay(BASE, CAP, attempt);
            let ceiling = floor + floor / 5;
            for _ in 0..200 {
                let delay = backoff_delay(BASE, CAP, attempt);
                assert!(
                    delay >= floor && delay <= ceiling,
                    "attempt {} produced {:?}, expected [{:?}, {:?}]",
                    attempt,
                    delay,
                    floor,
                    ceiling
                );
            }
        }
    }

    #[test]
    fn test_backoff_delay_bounded_past_cap() {
        let ceiling = CAP + CAP / 5;
        for attempt in [5, 10, 31, 32, 64, u32::MAX] {
            let delay = backoff_delay(BASE, CAP, attempt);
            assert!(delay >= CAP && delay <= ceiling, "attempt {} gave {:?}", attempt, delay);
        }
    }

    #[test]
    fn test_jitter_fraction_is_clamped() {
        assert_eq!(
            backoff_delay_with_jitter(BASE, CAP, 0, 0.0),
            Duration::from_millis(2_000)
        );
        assert_eq!(
            backoff_delay_with_jitter(BASE, CAP, 0, 0.2),
            Duration::from_millis(2_400)
        );
        assert_eq!(
            backoff_delay_with_jitter(BASE, CAP, 1, 5.0),
            Duration::from_millis(4_800)
        );
        assert_eq!(
            backoff_delay_with_jitter(BASE, CAP, 1, -1.0),
            Duration::from_millis(4_000)
        );
        assert_eq!(
            backoff_delay_with_jitter(BASE, CAP, 2, f64::NAN),
            Duration::from_millis(8_000)
        );
    }

    #[test]
    fn test_mean_delay_non_decreasing_until_cap() {
        let mut previous = Duration::ZERO;
        for attempt in 0..8 {
            let total: Duration = (0..100).map(|_| backoff_delay(BASE, CAP, attempt)).sum();
            let mean = total / 100;
            // Jitter can make two capped samples differ; compare against the un-jittered floor
            assert!(mean >= previous.min(CAP), "attempt {} mean {:?}", attempt, mean);
            previous = capped_delay(BASE, CAP, attempt);
        }
    }

    #[test]
    fn test_is_exhausted() {
        let policy = ReconnectPolicy::new(BASE, CAP, 3);
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
        assert!(is_exhausted(0, 0));
    }

    #[test]
    fn test_policy_from_config() {
        let config = StreamConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(800))
            .with_max_reconnect_attempts(4);
        let policy = ReconnectPolicy::from(&config);
        assert_eq!(
            policy,
            ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(800), 4)
        );
    }
}
