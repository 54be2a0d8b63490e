//! Retry policy for incoming envelopes whose handler failed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backoff_delay;

/// Decides when a failed envelope runs again, and when it is dead-lettered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Handler attempts before the envelope is moved to the dead letters.
    ///
    /// Default: 5 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (in seconds).
    ///
    /// The actual delay is calculated as: `base * 2^(attempts - 1)`
    ///
    /// Default: 5 seconds
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Maximum retry delay (in seconds).
    ///
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// The delay is randomized within ±`jitter_factor`.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Whether an envelope that has failed `attempts` times runs again.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    #[must_use]
    pub const fn remaining_attempts(&self, attempts: u32) -> u32 {
        self.max_attempts.saturating_sub(attempts)
    }

    /// Delay after the `attempts`-th failure
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        backoff_delay(
            attempts.max(1),
            Duration::from_secs(self.base_retry_delay_secs),
            Duration::from_secs(self.max_retry_delay_secs),
            self.retry_jitter_factor,
        )
    }

    /// When an envelope that has failed `attempts` times should run next
    #[must_use]
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay =
            chrono::Duration::from_std(self.delay_for(attempts)).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        5
    }

    pub const fn base_retry_delay_secs() -> u64 {
        5
    }

    pub const fn max_retry_delay_secs() -> u64 {
        300
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_retry_delay_secs: 10,
            max_retry_delay_secs: 100,
            retry_jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_retry_delay_secs, 5);
        assert_eq!(policy.max_retry_delay_secs, 300);
        assert!((policy.retry_jitter_factor - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_should_retry() {
        let policy = fixed();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(100));

        assert_eq!(policy.remaining_attempts(2), 3);
        assert_eq!(policy.remaining_attempts(30), 0);
    }

    #[test]
    fn test_next_retry_at() {
        let policy = fixed();
        let now = Utc::now();

        assert_eq!(policy.next_retry_at(1, now) - now, chrono::Duration::seconds(10));
        assert_eq!(policy.next_retry_at(2, now) - now, chrono::Duration::seconds(20));
        assert_eq!(policy.next_retry_at(3, now) - now, chrono::Duration::seconds(40));
        assert_eq!(policy.next_retry_at(10, now) - now, chrono::Duration::seconds(100));
    }

    #[test]
    fn test_deserialize_partial() {
        let policy: RetryPolicy = ron::from_str("(max_attempts: 2)").expect("valid ron");
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_retry_delay_secs, 5);
    }
}
