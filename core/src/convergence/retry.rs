//! Retry policies.
//!
//! Provides configurable retry behaviour with multiple backoff strategies
//! (fixed, linear, exponential). Resource `tries`/`try_sleep` map onto a
//! fixed policy; coordinator connection attempts use the configured
//! strategy.

use std::time::Duration;

use tracing::warn;

use crate::error::Result;
use crate::types::config::BackoffStrategy;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How many times an operation may run and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: BackoffStrategy, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            strategy,
            base_delay,
        }
    }

    /// `tries` attempts separated by a constant `try_sleep`.
    pub fn fixed(tries: u32, try_sleep: Duration) -> Self {
        Self::new(tries, BackoffStrategy::Fixed, try_sleep)
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Whether another attempt may follow attempt number `attempt`
    /// (1-indexed).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay after the failure of attempt number `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(step + 1),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(step.min(16))),
        }
    }

    /// Run `op` until it succeeds or the attempts are used up. Fatal errors
    /// are returned at once; otherwise only the last failure surfaces.
    pub fn retry<T, F>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_fatal() || !self.should_retry(attempt) => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        target_label = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        ?delay,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, exponential backoff, 1s base delay.
    fn default() -> Self {
        RetryPolicy::new(3, BackoffStrategy::Exponential, Duration::from_secs(1))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
