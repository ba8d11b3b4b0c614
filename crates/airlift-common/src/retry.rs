//! Retry utilities.
//!
//! Two flavours live here:
//!
//! - [`retry_with_backoff`]: exponential backoff with jitter, for short
//!   infrastructure calls (API discovery, single object reads) where the
//!   caller only cares about the eventual value.
//! - [`retry_fixed`]: a bounded loop with a fixed sleep between attempts and
//!   an optional wall-clock budget. This is what release remediation uses,
//!   because the caller must know how many attempts ran and why the loop
//!   stopped.
//!
//! # Example
//!
//! ```ignore
//! use airlift_common::retry::{retry_fixed, FixedRetryPolicy};
//!
//! let policy = FixedRetryPolicy::new(2, Duration::from_secs(10));
//! let revision = retry_fixed(&policy, "upgrade", |attempt| async move {
//!     upgrade_once(attempt).await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, warn};

/// Classifies errors for [`retry_fixed`]
///
/// Non-retryable errors end the loop after the attempt that produced them.
pub trait Retryable {
    /// Whether another attempt could plausibly succeed
    fn is_retryable(&self) -> bool;
}

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
/// Returns the last error once max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedRetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`
    pub max_retries: u32,
    /// Sleep between attempts
    pub backoff: Duration,
    /// Wall-clock budget across all attempts, checked between attempts
    pub max_total: Option<Duration>,
}

impl FixedRetryPolicy {
    /// Policy without an overall budget
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            max_total: None,
        }
    }

    /// Add an overall wall-clock budget
    pub fn with_max_total(mut self, max_total: Duration) -> Self {
        self.max_total = Some(max_total);
        self
    }

    /// Total attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Why [`retry_fixed`] gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed
    #[error("failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },

    /// The wall-clock budget ran out with attempts remaining
    #[error("gave up after {attempts} attempts and {elapsed:?}: {last}")]
    TimedOut {
        /// Attempts made
        attempts: u32,
        /// Time spent across all attempts
        elapsed: Duration,
        /// Error from the final attempt
        last: E,
    },

    /// An attempt returned a non-retryable error
    #[error("failed on attempt {attempts} with a non-retryable error: {error}")]
    Fatal {
        /// Attempts made, including the fatal one
        attempts: u32,
        /// The non-retryable error
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::TimedOut { attempts, .. }
            | RetryError::Fatal { attempts, .. } => *attempts,
        }
    }

    /// The error from the last attempt
    pub fn into_last(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::TimedOut { last, .. } => last,
            RetryError::Fatal { error, .. } => error,
        }
    }
}

/// Run `operation` until it succeeds or the policy says stop.
///
/// `operation` receives the 1-based attempt number. The budget is only
/// checked between attempts; an attempt in flight is never interrupted here.
pub async fn retry_fixed<F, Fut, T, E>(
    policy: &FixedRetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed with non-retryable error"
            );
            return Err(RetryError::Fatal {
                attempts: attempt,
                error: err,
            });
        }

        if attempt >= max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        warn!(
            operation = %operation_name,
            attempt,
            max_attempts,
            error = %err,
            delay_ms = policy.backoff.as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(policy.backoff).await;

        if let Some(budget) = policy.max_total {
            let elapsed = start.elapsed();
            if elapsed >= budget {
                error!(
                    operation = %operation_name,
                    attempt,
                    elapsed_ms = elapsed.as_millis(),
                    "Retry budget exhausted"
                );
                return Err(RetryError::TimedOut {
                    attempts: attempt,
                    elapsed,
                    last: err,
                });
            }
        }
    }
}
