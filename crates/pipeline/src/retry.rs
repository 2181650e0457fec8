//! Retry bookkeeping and policy.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use orderflow_core::OrderId;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// base * 2^(attempt - 1), capped at `max_backoff`
    Exponential,
}

/// Bounded retry policy.
///
/// `max_retries` is the total number of attempts an order gets: with 3, an order
/// that keeps failing is tried 3 times and waits 2 backoffs before it is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(2_000))
    }
}

impl RetryPolicy {
    /// Create a policy with a fixed delay between attempts.
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            max_backoff: backoff,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with capped exponential backoff.
    pub fn exponential(max_retries: u32, base: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff: base,
            max_backoff,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            BackoffStrategy::Fixed => self.backoff,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.backoff.saturating_mul(factor).min(self.max_backoff)
            }
        }
    }

    /// Check whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        !RetryTracker::is_exhausted(attempts, self.max_retries)
    }
}

/// Failed-attempt counts for orders that are currently being retried.
///
/// An id is present only between its first failure and its resolution (success or
/// dead-letter). The tracker is owned by exactly one dispatcher, so it needs no locking;
/// scaling out gives each worker its own partitions and its own tracker.
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: HashMap<OrderId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more failure for `id` and return the new total (1 on first failure).
    pub fn record_failure(&mut self, id: &OrderId) -> u32 {
        let attempts = self.attempts.entry(id.clone()).or_insert(0);
        *attempts += 1;
        *attempts
    }

    /// Forget `id` (idempotent).
    pub fn clear(&mut self, id: &OrderId) {
        self.attempts.remove(id);
    }

    pub fn attempts(&self, id: &OrderId) -> Option<u32> {
        self.attempts.get(id).copied()
    }

    /// Pure decision: no more attempts once `attempts` reached `max_retries`.
    pub fn is_exhausted(attempts: u32, max_retries: u32) -> bool {
        attempts >= max_retries
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
