//! Retry policy
//!
//! Exponential backoff with jitter over a per-step attempt budget.
//! `max_attempts` counts the total number of attempts including the
//! first, so a budget of 3 allows two retries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for step retries
///
/// # Example
///
/// ```
/// use contd_durable::reliability::RetryPolicy;
///
/// let policy = RetryPolicy::default()
///     .with_max_attempts(5)
///     .with_backoff_base(2.0)
///     .with_retryable_kind("connection_error");
///
/// assert!(policy.allows_retry(2));
/// assert!(!policy.allows_retry(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first attempt
    pub max_attempts: u32,

    /// Base of the exponential backoff, in seconds
    pub backoff_base: f64,

    /// Upper bound on any single backoff, in seconds
    pub backoff_max: f64,

    /// Jitter factor (0.0-1.0); 0.1 means +/-10% randomness
    pub backoff_jitter: f64,

    /// Error kinds that are retried even when the failure itself is not
    /// flagged retryable
    #[serde(default)]
    pub retryable_error_kinds: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 1.0,
            backoff_max: 60.0,
            backoff_jitter: 0.1,
            retryable_error_kinds: vec![],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_base: 0.0,
            backoff_max: 0.0,
            backoff_jitter: 0.0,
            retryable_error_kinds: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff_base(mut self, base: f64) -> Self {
        self.backoff_base = base.max(0.0);
        self
    }

    pub fn with_backoff_max(mut self, max: f64) -> Self {
        self.backoff_max = max.max(0.0);
        self
    }

    pub fn with_backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_retryable_kind(mut self, kind: impl Into<String>) -> Self {
        self.retryable_error_kinds.push(kind.into());
        self
    }

    /// Whether another attempt may follow `attempt` (1-based) failing.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether an error kind is in the configured retryable set.
    pub fn kind_is_retryable(&self, kind: &str) -> bool {
        self.retryable_error_kinds.iter().any(|k| k == kind)
    }

    /// Backoff to sleep after `attempt` (1-based) failed.
    ///
    /// Exponential in the attempt number, capped at `backoff_max`, with
    /// symmetric jitter applied last.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        if self.backoff_base <= 0.0 {
            return Duration::ZERO;
        }

        let exponential = self.backoff_base.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = if self.backoff_max > 0.0 {
            exponential.min(self.backoff_max)
        } else {
            exponential
        };

        let jittered = if self.backoff_jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.backoff_jitter;
            let offset = rng.gen_range(-range..=range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}
