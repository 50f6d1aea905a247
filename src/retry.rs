//! Retry executor for LLM operations with exponential backoff.
//!
//! Applies the retry strategy that matches the error category: rate limits
//! wait for the reset hint, timeouts and provider 5xx back off exponentially,
//! permanent errors are returned immediately.

use crate::error::{Result, RetryStrategy};
use std::future::Future;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Executor for retry logic with configurable backoff strategies.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryExecutor {
    log_retries: bool,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new() -> Self {
        Self { log_retries: true }
    }

    /// Create a retry executor that does not log attempts.
    pub fn silent() -> Self {
        Self { log_retries: false }
    }

    /// Execute an operation, retrying retryable failures up to `max_retries`
    /// additional attempts.
    ///
    /// The strategy is derived from the first error: a non-retryable error is
    /// returned as-is, a retryable one drives the matching wait/backoff loop.
    pub async fn execute_auto<F, Fut, T>(&self, max_retries: u32, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match operation().await {
            Ok(v) => Ok(v),
            Err(e) => {
                let strategy = e.retry_strategy(max_retries);
                if !strategy.should_retry() {
                    return Err(e);
                }
                if self.log_retries {
                    debug!(error = %e, ?strategy, "first attempt failed, retrying");
                }
                match strategy {
                    RetryStrategy::WaitAndRetry { wait } => {
                        sleep(wait).await;
                        operation().await
                    }
                    RetryStrategy::ExponentialBackoff {
                        base_delay,
                        max_delay,
                        max_attempts,
                    } => {
                        sleep(base_delay).await;
                        self.backoff_loop(
                            (base_delay * 2).min(max_delay),
                            max_delay,
                            max_attempts.saturating_sub(1),
                            operation,
                        )
                        .await
                    }
                    RetryStrategy::NoRetry => Err(e),
                }
            }
        }
    }

    /// Execute with an explicit strategy.
    pub async fn execute<F, Fut, T>(
        &self,
        strategy: &RetryStrategy,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match strategy {
            RetryStrategy::NoRetry => operation().await,
            RetryStrategy::WaitAndRetry { wait } => match operation().await {
                Ok(v) => Ok(v),
                Err(e) => {
                    if self.log_retries {
                        warn!(error = %e, wait_ms = wait.as_millis() as u64, "waiting before retry");
                    }
                    sleep(*wait).await;
                    operation().await
                }
            },
            RetryStrategy::ExponentialBackoff {
                base_delay,
                max_delay,
                max_attempts,
            } => {
                self.backoff_loop(*base_delay, *max_delay, *max_attempts, operation)
                    .await
            }
        }
    }

    async fn backoff_loop<F, Fut, T>(
        &self,
        base_delay: std::time::Duration,
        max_delay: std::time::Duration,
        max_attempts: u32,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = base_delay;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match operation().await {
                Ok(v) => {
                    if attempts > 1 && self.log_retries {
                        info!(attempts, "operation succeeded after retries");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        if self.log_retries {
                            warn!(attempts, error = %e, "giving up after retries");
                        }
                        return Err(e);
                    }
                    // A non-retryable error can show up mid-loop (e.g. a 429
                    // followed by a 401); stop immediately.
                    if !e.is_retryable() {
                        if self.log_retries {
                            debug!(error = %e, "non-retryable error, stopping");
                        }
                        return Err(e);
                    }
                    if self.log_retries {
                        warn!(
                            attempts,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "attempt failed, retrying"
                        );
                    }
                    sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_success_passes_through() {
        let executor = RetryExecutor::silent();
        let result = executor
            .execute_auto(3, || async { Ok::<_, LlmError>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let executor = RetryExecutor::silent();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<i32> = executor
            .execute_auto(5, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::Auth("bad key".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_retried_until_success() {
        let executor = RetryExecutor::silent();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = executor
            .execute(
                &RetryStrategy::ExponentialBackoff {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(4),
                    max_attempts: 4,
                },
                || {
                    let calls = calls2.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 3 {
                            Err(LlmError::Server {
                                status: 500,
                                message: "flaky".into(),
                            })
                        } else {
                            Ok(7)
                        }
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_gives_up() {
        let executor = RetryExecutor::silent();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<i32> = executor
            .execute(
                &RetryStrategy::ExponentialBackoff {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    max_attempts: 3,
                },
                || {
                    let calls = calls2.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(LlmError::Timeout("always".into()))
                    }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_stops_on_permanent_error() {
        let executor = RetryExecutor::silent();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<i32> = executor
            .execute(
                &RetryStrategy::ExponentialBackoff {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    max_attempts: 5,
                },
                || {
                    let calls = calls2.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if n == 1 {
                            Err(LlmError::Server {
                                status: 500,
                                message: "first".into(),
                            })
                        } else {
                            Err(LlmError::InvalidRequest("now permanent".into()))
                        }
                    }
                },
            )
            .await;

        assert!(matches!(result, Err(LlmError::InvalidRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wait_and_retry_retries_once() {
        let executor = RetryExecutor::silent();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = executor
            .execute(
                &RetryStrategy::WaitAndRetry {
                    wait: Duration::from_millis(1),
                },
                || {
                    let calls = calls2.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 2 {
                            Err(LlmError::RateLimited("wait".into()))
                        } else {
                            Ok(1)
                        }
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
