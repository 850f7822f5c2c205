//! Retry with exponential backoff for adapter calls.
//!
//! Every adapter error except [`ErrorKind::TooLong`] is retried until the
//! policy's attempt cap. `TooLong` is returned immediately so the caller can
//! treat it as a permanent skip. Backoff sleeps race the cancellation token.

use std::future::Future;
use std::time::Duration;

use code_analyzer_core::adapters::{AdapterError, ErrorKind};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    /// Maximum attempts, including the first try.
    pub max_attempts: u32,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(8),
            max_attempts: 5,
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` failed (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: AdapterError,
    },

    #[error("{operation} input too long: {source}")]
    TooLong {
        operation: &'static str,
        #[source]
        source: AdapterError,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },
}

/// Run `op` until it succeeds, fails with `TooLong`, exhausts the policy,
/// or `cancel` fires.
pub async fn retry_adapter<T, F, Fut>(
    cancel: &CancellationToken,
    policy: RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { operation });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { operation }),
            result = op() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(error) if error.kind == ErrorKind::TooLong => {
                return Err(RetryError::TooLong {
                    operation,
                    source: error,
                });
            }
            Err(error) => {
                if attempt >= max_attempts {
                    tracing::warn!(operation, attempts = attempt, error = %error, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        operation,
                        attempts: attempt,
                        source: error,
                    });
                }

                let delay = policy.backoff(attempt);
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled { operation }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
