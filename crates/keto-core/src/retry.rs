use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Bounded retry with exponential backoff and per-attempt classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts (including the first).
    pub max_attempts: u32,
    /// Delay after first failure, doubled on each subsequent failure.
    pub base_delay: Duration,
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError {
    /// Attempts actually made.
    pub attempts: u32,
    /// Error from the last attempt.
    pub last: Error,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Credential issuance: five attempts, short backoff.
    pub const fn issuance() -> Self {
        Self::new(5, Duration::from_millis(100))
    }

    /// Run `f` until it succeeds, returns a non-retryable error, or attempts run out.
    ///
    /// - `label`: Description for log messages.
    /// - `retryable`: Classifies an attempt's error; `false` stops immediately.
    pub async fn run<F, Fut, T, C>(
        &self,
        label: &str,
        retryable: C,
        mut f: F,
    ) -> std::result::Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.base_delay;
        let mut attempt = 1;

        loop {
            match f(attempt).await {
                Ok(val) => return Ok(val),
                Err(e) => {
                    if attempt >= max_attempts || !retryable(&e) {
                        return Err(RetryError { attempts: attempt, last: e });
                    }
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::issuance()
    }
}
