//! Fixed-table retry policy for callback delivery.
//!
//! The delay after a failed attempt is looked up by attempt number in a
//! fixed table. No jitter, no cap beyond the table itself.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hookwork_core::models::MAX_DELIVERY_ATTEMPTS;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Backoff table in seconds, indexed by the number of the failed attempt.
pub const DEFAULT_BACKOFF_SECS: [u64; 5] = [1, 2, 4, 8, 16];

/// Retry policy for callback delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts, including the first.
    pub max_attempts: u32,
    /// Wait after attempt `n` fails is `backoff[n - 1]`; the last entry
    /// repeats if the table is shorter than `max_attempts`.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_DELIVERY_ATTEMPTS,
            backoff: DEFAULT_BACKOFF_SECS.iter().copied().map(Duration::from_secs).collect(),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then try again.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
        /// `failed_at + delay`.
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop and terminalize the delivery.
    GiveUp {
        /// Recorded as the delivery's `last_error`.
        reason: String,
    },
}

impl RetryPolicy {
    /// Checks the policy against the per-request attempt budget.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if `max_attempts` is zero or
    /// above the budget, or the backoff table is empty.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 || self.max_attempts > MAX_DELIVERY_ATTEMPTS {
            return Err(DeliveryError::configuration(format!(
                "max_attempts must be between 1 and {MAX_DELIVERY_ATTEMPTS}, got {}",
                self.max_attempts
            )));
        }
        if self.backoff.is_empty() {
            return Err(DeliveryError::configuration("backoff table must not be empty"));
        }
        Ok(())
    }

    /// Backoff after attempt number `attempt` (1-based) fails.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }

    /// Decides the follow-up for attempt number `attempt` that failed with
    /// `error` at `failed_at`.
    pub fn decide(
        &self,
        attempt: u32,
        error: &DeliveryError,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: error.to_string() };
        }

        if attempt >= self.max_attempts {
            let exhausted = DeliveryError::RetriesExhausted {
                attempts: self.max_attempts,
                last_error: error.to_string(),
            };
            return RetryDecision::GiveUp { reason: exhausted.to_string() };
        }

        let delay = self.delay_for(attempt);
        let Ok(step) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { delay, next_attempt_at: failed_at + step }
    }

    /// Sum of all waits a delivery that always fails goes through.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts).map(|attempt| self.delay_for(attempt)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_indexed_by_attempt_number() {
        let policy = RetryPolicy::default();

        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_secs()).collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn retries_until_budget_then_gives_up() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let error = DeliveryError::http_status(500, "");

        for attempt in 1..5 {
            match policy.decide(attempt, &error, now) {
                RetryDecision::Retry { delay, next_attempt_at } => {
                    assert_eq!(delay, policy.delay_for(attempt));
                    assert_eq!(next_attempt_at - now, chrono::Duration::from_std(delay).unwrap());
                },
                RetryDecision::GiveUp { .. } => panic!("attempt {attempt} should retry"),
            }
        }

        assert_eq!(
            policy.decide(5, &error, now),
            RetryDecision::GiveUp { reason: "max attempts (5) exhausted: HTTP 500".to_string() }
        );
    }

    #[test]
    fn non_retryable_errors_give_up_immediately() {
        let policy = RetryPolicy::default();

        let decision = policy.decide(1, &DeliveryError::configuration("bad url"), Utc::now());

        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn total_backoff_for_default_policy() {
        assert_eq!(RetryPolicy::default().total_backoff(), Duration::from_secs(15));
    }

    #[test]
    fn short_table_repeats_last_entry() {
        let policy =
            RetryPolicy { max_attempts: 4, backoff: vec![Duration::from_millis(10)] };

        assert_eq!(policy.delay_for(3), Duration::from_millis(10));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn validation_bounds() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy { max_attempts: 6, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy { backoff: vec![], ..Default::default() }.validate().is_err());
    }
}
