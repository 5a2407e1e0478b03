//! Bounded retry policy.
//!
//! # Responsibilities
//! - Hold the retry budget (attempt count, base and maximum delay)
//! - Execute an async operation with exponential backoff + jitter
//! - Stop early when the caller's cancellation token fires
//!
//! # Design Decisions
//! - The budget is always finite; exhaustion is reported, never hidden
//! - Jittered backoff prevents reconnect storms against a shared broker

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::resilience::backoff::calculate_backoff;

/// Outcome of a retried operation that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    /// The cancellation token fired between attempts.
    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The last operation error, if the budget was exhausted.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled => None,
        }
    }
}

/// Retry budget with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before the given (zero-based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay_ms, self.max_delay_ms)
    }

    /// Run `op` until it succeeds, the budget is spent or `token` fires.
    pub async fn run<F, Fut, T, E>(
        &self,
        what: &str,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Err(RetryError::Cancelled),
                }
            }
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(RetryError::Exhausted { attempts, last: e });
                    }
                    tracing::warn!(
                        operation = what,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result = fast()
            .run("op", &token, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("not yet")
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let token = CancellationToken::new();
        let result: Result<(), _> = fast()
            .run("op", &token, |attempt| async move { Err(format!("fail {attempt}")) })
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "fail 2");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), RetryError<&str>> =
            fast().run("op", &token, |_| async { Err("x") }).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
