//! Exponential backoff for calls against object storage and the result stream.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Backoff schedule. `max_attempts = None` retries until cancelled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: Option<u32>,
    /// Delay before the second attempt; doubles on every further attempt.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(5, Duration::from_millis(200))
    }
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            base_delay,
            max_delay: Duration::from_secs(10),
        }
    }

    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay,
            max_delay,
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exp))
            .min(self.max_delay)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { error: E, attempts: u32 },
    Cancelled,
}

/// Runs `operation` until it succeeds, the policy is exhausted, or `cancel` fires.
/// Sleeps between attempts are cancellation-aware.
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if policy.exhausted(attempts) => {
                return Err(RetryError::Exhausted { error, attempts });
            }
            Err(error) => {
                let delay = policy.delay_for_attempt(attempts);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Operation failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
