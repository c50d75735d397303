//! Retry policy: decides whether a failed attempt is retried and how long to back off.

use std::time::Duration;

/// Outcome of asking the policy about a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue. `attempt` is the retry number (1-indexed) about to be used.
    Retry { attempt: u32, delay: Duration },
    /// Retry budget exhausted; the task fails.
    GiveUp,
}

/// Retry policy for failed tasks.
///
/// Exponential backoff: `delay = base_delay * multiplier^(attempt - 1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Decide what to do after a failure.
    ///
    /// `retries` is the number of retries already consumed.
    pub fn decide(&self, retries: u32, max_retries: u32) -> RetryDecision {
        if retries >= max_retries {
            return RetryDecision::GiveUp;
        }
        let attempt = retries + 1;
        RetryDecision::Retry {
            attempt,
            delay: self.next_delay(attempt),
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        if !delay_secs.is_finite() || delay_secs >= max_secs {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}
