//! Cooldown tracking for failed attempts.
//!
//! Every retryable failure is tagged with a [`FailureClass`]. Consecutive
//! failures of the same class push that class's cooldown out exponentially:
//! `base * 2^(failures - 1)`, capped at `max`. A rate-limited response may
//! carry its own `Retry-After`, in which case the longer of the two wins.
//! One successful send clears every class.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Class of a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// HTTP 429 or an explicit rate-limit response.
    RateLimited,
    /// HTTP 5xx or 408.
    ServerError,
    /// Timeout or other transport error after the connection was made.
    NetworkFailure,
    /// The endpoint could not be reached at all.
    NoConnectivity,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::NetworkFailure => "network_failure",
            Self::NoConnectivity => "no_connectivity",
        };
        f.write_str(name)
    }
}

/// Backoff growth for consecutive failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Cooldown after the first failure of a class.
    pub backoff_base: Duration,
    /// Cooldown cap.
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Cooldown for the given number of consecutive failures.
    ///
    /// | Failures | Delay (base=2s, max=300s) |
    /// |----------|---------------------------|
    /// | 0        | 0s                        |
    /// | 1        | 2s                        |
    /// | 2        | 4s                        |
    /// | 3        | 8s                        |
    /// | 9+       | 300s                      |
    pub fn compute_backoff(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 1).min(31);
        let multiplier = 1u32 << exponent;
        self.backoff_base
            .checked_mul(multiplier)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy)]
struct Cooldown {
    consecutive_failures: u32,
    until: DateTime<Utc>,
}

/// Per-class cooldown tracker.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RetryPolicy,
    cooldowns: HashMap<FailureClass, Cooldown>,
}

impl RateLimiter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cooldowns: HashMap::new(),
        }
    }

    /// Record a failed attempt at `now`.
    ///
    /// Returns the instant the class's cooldown ends.
    pub fn record_failure(
        &mut self,
        class: FailureClass,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let consecutive_failures = self
            .cooldowns
            .get(&class)
            .map(|c| c.consecutive_failures.saturating_add(1))
            .unwrap_or(1);

        let mut delay = self.policy.compute_backoff(consecutive_failures);
        if let Some(retry_after) = retry_after {
            delay = delay.max(retry_after);
        }
        let until = now
            .checked_add_signed(to_chrono(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.cooldowns.insert(
            class,
            Cooldown {
                consecutive_failures,
                until,
            },
        );
        until
    }

    /// A successful send resets every class.
    pub fn record_success(&mut self) {
        self.cooldowns.clear();
    }

    /// Whether attempts that would hit `class` must wait.
    #[cfg(test)]
    fn is_blocked(&self, class: FailureClass, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .get(&class)
            .map(|c| now < c.until)
            .unwrap_or(false)
    }

    /// The active cooldown ending last, if any.
    ///
    /// Every entry targets the same endpoint, so any active class blocks
    /// every attempt.
    pub fn active_cooldown(&self, now: DateTime<Utc>) -> Option<(FailureClass, DateTime<Utc>)> {
        self.cooldowns
            .iter()
            .filter(|(_, c)| now < c.until)
            .max_by_key(|(_, c)| c.until)
            .map(|(class, c)| (*class, c.until))
    }

    pub fn consecutive_failures(&self, class: FailureClass) -> u32 {
        self.cooldowns
            .get(&class)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(10),
        }
    }

    #[test]
    fn compute_backoff_caps_and_grows() {
        let policy = policy();
        assert_eq!(policy.compute_backoff(1), Duration::from_secs(2));
        assert_eq!(policy.compute_backoff(2), Duration::from_secs(4));
        assert_eq!(policy.compute_backoff(3), Duration::from_secs(8));
        assert_eq!(policy.compute_backoff(4), Duration::from_secs(10));
    }

    #[test]
    fn compute_backoff_zero_without_failures() {
        assert_eq!(policy().compute_backoff(0), Duration::ZERO);
    }

    #[test]
    fn compute_backoff_large_count_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.compute_backoff(500), policy.backoff_max);
        assert_eq!(policy.compute_backoff(u32::MAX), policy.backoff_max);
    }

    #[test]
    fn failure_blocks_until_cooldown_elapses() {
        let mut limiter = RateLimiter::new(policy());
        let now = Utc::now();

        limiter.record_failure(FailureClass::NetworkFailure, None, now);

        assert!(limiter.is_blocked(FailureClass::NetworkFailure, now));
        assert!(limiter.is_blocked(
            FailureClass::NetworkFailure,
            now + chrono::Duration::milliseconds(1999)
        ));
        assert!(!limiter.is_blocked(
            FailureClass::NetworkFailure,
            now + chrono::Duration::seconds(2)
        ));
        assert!(!limiter.is_blocked(FailureClass::RateLimited, now));
    }

    #[test]
    fn consecutive_failures_grow_cooldown() {
        let mut limiter = RateLimiter::new(policy());
        let now = Utc::now();

        let first = limiter.record_failure(FailureClass::ServerError, None, now);
        let second = limiter.record_failure(FailureClass::ServerError, None, now);

        assert_eq!(first, now + chrono::Duration::seconds(2));
        assert_eq!(second, now + chrono::Duration::seconds(4));
        assert_eq!(limiter.consecutive_failures(FailureClass::ServerError), 2);
    }

    #[test]
    fn retry_after_extends_cooldown() {
        let mut limiter = RateLimiter::new(policy());
        let now = Utc::now();

        let until =
            limiter.record_failure(FailureClass::RateLimited, Some(Duration::from_secs(60)), now);

        assert_eq!(until, now + chrono::Duration::seconds(60));
        assert_eq!(
            limiter.active_cooldown(now),
            Some((FailureClass::RateLimited, until))
        );
    }

    #[test]
    fn short_retry_after_does_not_shorten_backoff() {
        let mut limiter = RateLimiter::new(policy());
        let now = Utc::now();

        let until =
            limiter.record_failure(FailureClass::RateLimited, Some(Duration::from_secs(1)), now);
        assert_eq!(until, now + chrono::Duration::seconds(2));
    }

    #[test]
    fn success_resets_all_classes() {
        let mut limiter = RateLimiter::new(policy());
        let now = Utc::now();
        limiter.record_failure(FailureClass::RateLimited, None, now);
        limiter.record_failure(FailureClass::NoConnectivity, None, now);

        limiter.record_success();

        assert!(limiter.active_cooldown(now).is_none());
        assert_eq!(limiter.consecutive_failures(FailureClass::RateLimited), 0);

        let until = limiter.record_failure(FailureClass::RateLimited, None, now);
        assert_eq!(until, now + chrono::Duration::seconds(2));
    }

    #[test]
    fn active_cooldown_picks_latest() {
        let mut limiter = RateLimiter::new(policy());
        let now = Utc::now();
        limiter.record_failure(FailureClass::NetworkFailure, None, now);
        limiter.record_failure(FailureClass::RateLimited, Some(Duration::from_secs(30)), now);

        let (class, _) = limiter.active_cooldown(now).unwrap();
        assert_eq!(class, FailureClass::RateLimited);
        assert!(limiter
            .active_cooldown(now + chrono::Duration::seconds(31))
            .is_none());
    }
}
