//! Bounded exponential backoff for store calls
//!
//! Business errors propagate on the first occurrence. Transient errors are
//! retried up to `max_retries` times, sleeping `base_delay * 2^attempt`
//! (capped at `max_delay`) between attempts.

use crate::error::{Classify, ErrorClass, VoteError};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Outcome of a call that did not succeed under the policy
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("{0}")]
    Business(E),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Unwrap the business error, if that is what this is
    pub fn business(self) -> Option<E> {
        match self {
            RetryError::Business(e) => Some(e),
            RetryError::Exhausted { .. } => None,
        }
    }
}

impl<E: fmt::Display> From<RetryError<E>> for VoteError {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Business(e) => VoteError::InvalidRecord(e.to_string()),
            RetryError::Exhausted {
                operation,
                attempts,
                last,
            } => VoteError::unavailable(&operation, attempts, last.to_string()),
        }
    }
}

/// Retry policy shared by every retryable call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Classify an error as business or transient
    pub fn classify<E: Classify>(error: &E) -> ErrorClass {
        error.class()
    }

    /// delay = min(base_delay * 2^attempt, max_delay)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(63));
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }

    /// Run `call` until it succeeds, fails with a business error, or the
    /// retry budget is spent.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("Retry: {} succeeded on attempt {}", operation, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) if Self::classify(&e) == ErrorClass::Business => {
                    return Err(RetryError::Business(e));
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        warn!(
                            "Retry: {} exhausted after {} attempts: {}",
                            operation,
                            attempt + 1,
                            e
                        );
                        return Err(RetryError::Exhausted {
                            operation: operation.to_string(),
                            attempts: attempt + 1,
                            last: e,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        "Retry: {} attempt {} failed: {}. Retrying in {:?}",
                        operation,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
