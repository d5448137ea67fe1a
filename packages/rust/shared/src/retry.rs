//! Data-driven retry policy shared by the fetcher and the judge client.
//!
//! The policy only describes the schedule; callers own the loop, so the
//! backoff behavior is testable independent of the operation it wraps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry schedule: how many attempts, and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Must be at least 1.
    pub max_attempts: u32,
    /// Exponential backoff base in seconds: the wait before attempt `n+1`
    /// is `backoff_base_secs ^ n`.
    pub backoff_base_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base_secs: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base_secs,
        }
    }

    /// Backoff to sleep after the given 1-based attempt fails, or `None`
    /// when the attempt was the last one.
    pub fn backoff_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let secs = self.backoff_base_secs.saturating_pow(attempt);
        Some(Duration::from_secs(secs))
    }

    /// 1-based attempt numbers in order.
    pub fn attempts(&self) -> impl Iterator<Item = u32> + use<> {
        1..=self.max_attempts
    }
}
