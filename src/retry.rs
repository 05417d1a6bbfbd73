//! Retry policy with exponential backoff
//!
//! [`RetryPolicy::decide`] is consulted once per failed task execution and
//! only returns a decision; the worker applies it. The delay before retry `n`
//! (1-based) is `base_delay * 2^(n-1)`, capped at `max_delay` and optionally
//! spread by ±20%.
//!
//! [`with_retry`] applies the same policy to an in-process async operation and
//! is used for webhook delivery.
//!
//! # Example
//!
//! ```no_run
//! use clipflow::retry::{IsRetryable, with_retry};
//! use clipflow::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let result = with_retry(&config, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, FailureKind, TaskError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, rate limits, connection reset) should return `true`.
/// Permanent failures (invalid input, authorization failure) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TaskError {
    fn is_retryable(&self) -> bool {
        self.kind != FailureKind::Permanent
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| {
                        s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS
                    })
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Everything else is a caller or state error
            _ => false,
        }
    }
}

/// Outcome of consulting the retry policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after `delay`
    Retry {
        /// Backoff before the next attempt
        delay: Duration,
        /// Whether the failure consumes one unit of the retry budget
        consume_attempt: bool,
    },
    /// Terminal failure
    GiveUp,
}

/// Pure retry decision function over a [`RetryConfig`]
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry budget for tasks that do not set their own
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Decide what happens after a failed execution
    ///
    /// `attempt` is the number of retries already consumed by the task.
    pub fn decide(&self, kind: FailureKind, attempt: u32, max_attempts: u32) -> RetryDecision {
        match kind {
            FailureKind::Permanent => RetryDecision::GiveUp,
            FailureKind::WorkerLost => RetryDecision::Retry {
                delay: Duration::ZERO,
                consume_attempt: false,
            },
            FailureKind::Transient if attempt < max_attempts => RetryDecision::Retry {
                delay: self.delay_for(attempt + 1),
                consume_attempt: true,
            },
            FailureKind::Transient => RetryDecision::GiveUp,
        }
    }

    /// Capped, unjittered delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent);
        factor
            .and_then(|f| self.config.base_delay.checked_mul(f))
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay))
    }

    /// Delay before retry number `retry`, jittered when configured
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.config.jitter {
            add_jitter(delay).min(self.config.max_delay)
        } else {
            delay
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// The operation runs at most `config.max_attempts + 1` times. Non-retryable
/// errors are returned immediately.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let policy = RetryPolicy::new(config.clone());
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;
                let delay = policy.delay_for(attempt);

                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Spread a delay uniformly over ±20%
fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
