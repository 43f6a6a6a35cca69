use std::time::Duration;

use herald_core::RetrySettings;
use serde::{Deserialize, Serialize};

/// How a failed send attempt should be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network fault, timeout, 4xx reply; may succeed later.
    Transient,
    /// Rejected recipient, malformed message, 5xx reply; will never succeed.
    Permanent,
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the email and try again after the given delay.
    RetryAfter(Duration),
    /// Mark the email failed; no further attempts.
    GiveUp,
}

/// Exponential backoff for transient send failures.
///
/// Schedule with the defaults: 30 s → 60 s → 120 s → … → 1 h (cap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self::new(
            Duration::from_secs(s.base_delay_secs),
            Duration::from_secs(s.max_delay_secs),
        )
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Requeue immediately. Handy for tests that drive cycles by hand.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// `min(base_delay * 2^retry_count, max_delay)`, saturating on overflow.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Decide what happens after a failed attempt.
    ///
    /// `retry_count` is the number of retries already consumed, i.e. the value
    /// stored on the email before this failure is recorded.
    pub fn decide(&self, retry_count: u32, max_retries: u32, kind: FailureKind) -> RetryDecision {
        match kind {
            FailureKind::Permanent => RetryDecision::GiveUp,
            FailureKind::Transient if retry_count < max_retries => {
                RetryDecision::RetryAfter(self.backoff(retry_count))
            }
            FailureKind::Transient => RetryDecision::GiveUp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(100))
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_secs(10));
        assert_eq!(p.backoff(1), Duration::from_secs(20));
        assert_eq!(p.backoff(2), Duration::from_secs(40));
        assert_eq!(p.backoff(3), Duration::from_secs(80));
        assert_eq!(p.backoff(4), Duration::from_secs(100));
        assert_eq!(p.backoff(40), Duration::from_secs(100));
    }

    #[test]
    fn transient_retries_until_budget_spent() {
        let p = policy();
        assert_eq!(
            p.decide(0, 2, FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::from_secs(10))
        );
        assert_eq!(
            p.decide(1, 2, FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::from_secs(20))
        );
        assert_eq!(p.decide(2, 2, FailureKind::Transient), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_max_retries_never_retries() {
        assert_eq!(
            policy().decide(0, 0, FailureKind::Transient),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn permanent_failure_skips_remaining_retries() {
        assert_eq!(
            policy().decide(0, 5, FailureKind::Permanent),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn defaults_match_settings_defaults() {
        assert_eq!(
            RetryPolicy::from(&RetrySettings::default()),
            RetryPolicy::default()
        );
    }

    #[test]
    fn immediate_policy_has_no_delay() {
        assert_eq!(
            RetryPolicy::immediate().decide(0, 1, FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::ZERO)
        );
    }
}
