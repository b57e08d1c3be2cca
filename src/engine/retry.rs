// Retry decisions for step execution.
// Pure: no sleeping happens here, the executor owns the waiting.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retryable_error_kinds: BTreeSet<ErrorKind>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transient(3)
    }
}

impl RetryPolicy {
    /// Retries connection and timeout failures up to `max_attempts` total attempts.
    pub fn transient(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            retryable_error_kinds: [ErrorKind::Connection, ErrorKind::Timeout]
                .into_iter()
                .collect(),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }

    /// A single attempt; every failure is final.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            retryable_error_kinds: BTreeSet::new(),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn with_retryable(mut self, kind: ErrorKind) -> Self {
        self.retryable_error_kinds.insert(kind);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_error_kinds.contains(&kind)
    }

    /// Decide whether attempt number `attempt` (1-based) should be followed
    /// by another one after failing with `kind`.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts || !self.is_retryable(kind) {
            return RetryDecision::give_up();
        }
        RetryDecision {
            retry: true,
            delay: self.backoff_delay(attempt),
        }
    }

    /// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max_delay`.
    /// With jitter the delay is drawn uniformly from `[delay / 2, delay]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let millis = delay.as_millis() as u64;
            let jittered = rand::rng().random_range(millis / 2..=millis);
            Duration::from_millis(jittered)
        } else {
            delay
        }
    }
}
