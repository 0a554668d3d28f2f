//! Exponential backoff with explicit state.
//!
//! Retries are driven by a loop that owns a [`Backoff`] value rather than by
//! recursion, so every retry boundary is a place where shutdown can be
//! observed.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

const BACKOFF_FACTOR: u32 = 2;

/// How a manager call is retried on transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound for a single delay.
    pub ceiling: Duration,
    /// Attempts (including the first) before the call gives up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

/// Calculate the next backoff duration.
fn next_backoff(current: Duration, ceiling: Duration) -> Duration {
    current.saturating_mul(BACKOFF_FACTOR).min(ceiling)
}

/// Retry state: attempts made so far and the delay before the next one.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            delay: policy.initial.min(policy.ceiling),
        }
    }

    /// Failed attempts recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once the attempt
    /// budget is spent.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        Some(self.advance())
    }

    /// Record a failure without an attempt budget and return the delay.
    ///
    /// Used by loops that never give up (heartbeats, pending reports).
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.advance()
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.policy.initial.min(self.policy.ceiling);
    }

    fn advance(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = next_backoff(self.delay, self.policy.ceiling);
        delay
    }
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `false` if the wait was interrupted.
pub async fn wait(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
