//! # Retry policy for stage attempts.
//!
//! [`RetryPolicy`] controls how often a failed stage is attempted again and how
//! long the runner waits in between. It is parameterized by:
//! - [`RetryPolicy::initial_interval`] the delay before the first retry;
//! - [`RetryPolicy::backoff_coefficient`] the multiplicative growth factor;
//! - [`RetryPolicy::max_interval`] the delay cap;
//! - [`RetryPolicy::max_attempts`] total attempts including the first (`0` = unlimited).
//!
//! The delay before retry `n` (0-indexed) is `initial × coefficient^n`, clamped
//! to `max_interval`.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use preemptvisor::RetryPolicy;
//!
//! let retry = RetryPolicy::default();
//!
//! assert_eq!(retry.next(0), Duration::from_secs(2));
//! assert_eq!(retry.next(1), Duration::from_secs(4));
//! assert_eq!(retry.next(2), Duration::from_secs(8));
//! assert_eq!(retry.next(3), Duration::from_secs(10)); // capped
//! ```

use std::time::Duration;

use crate::error::StageError;

/// Declarative retry contract applied to every retryable stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplicative growth factor (`>= 1.0`).
    pub backoff_coefficient: f64,
    /// Maximum delay between two attempts.
    pub max_interval: Duration,
    /// Maximum number of attempts, the first one included (`0` = unlimited).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    /// Returns a policy with:
    /// - `initial_interval = 2s`;
    /// - `backoff_coefficient = 2.0`;
    /// - `max_interval = 10s`;
    /// - `max_attempts = 3`.
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Computes the delay before retry number `retry` (0-indexed).
    ///
    /// # Notes
    /// - If `backoff_coefficient` equals 1.0 the delay stays at `initial_interval`.
    /// - Overflowing or non-finite intermediate values clamp to `max_interval`.
    pub fn next(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exp);

        Duration::try_from_secs_f64(secs)
            .map_or(self.max_interval, |delay| delay.min(self.max_interval))
    }

    /// Whether attempt number `attempt` (1-based) is still within budget.
    #[inline]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }

    /// Whether a stage that just failed attempt `attempt` (1-based) with `err`
    /// gets another attempt.
    pub fn should_retry(&self, attempt: u32, err: &StageError) -> bool {
        err.is_retryable() && self.allows_attempt(attempt.saturating_add(1))
    }
}
