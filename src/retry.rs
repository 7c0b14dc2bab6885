//! Retry executor with exponential backoff.
//!
//! Wraps an async operation and retries it according to a
//! [`RetryStrategy`]. Errors whose own strategy is `NoRetry` (caller errors,
//! breaker denials, tool failures) stop the loop immediately.
//!
//! # Usage
//!
//! ```ignore
//! use edgequake_pipeline::retry::RetryExecutor;
//! use edgequake_pipeline::error::RetryStrategy;
//!
//! let executor = RetryExecutor::new();
//! let response = executor
//!     .execute(&RetryStrategy::network_backoff(), || async {
//!         backend.execute(&request).await
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result, RetryStrategy};

/// Executor for retry logic with configurable backoff strategies.
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    log_retries: bool,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new() -> Self {
        Self { log_retries: true }
    }

    /// Create a retry executor without logging.
    pub fn silent() -> Self {
        Self { log_retries: false }
    }

    /// Execute an async operation with retries according to `strategy`.
    ///
    /// Returns the first success, or the last error once the strategy is
    /// exhausted or a non-retryable error occurs.
    pub async fn execute<F, Fut, T>(&self, strategy: &RetryStrategy, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match strategy {
            RetryStrategy::NoRetry => operation().await,

            RetryStrategy::WaitAndRetry { wait } => {
                self.execute_wait_and_retry(*wait, operation).await
            }

            RetryStrategy::ExponentialBackoff {
                base_delay,
                max_delay,
                max_attempts,
            } => {
                self.execute_exponential_backoff(*base_delay, *max_delay, *max_attempts, operation)
                    .await
            }
        }
    }

    fn is_final(&self, error: &PipelineError) -> bool {
        let final_error = !error.is_recoverable();
        if final_error && self.log_retries {
            debug!(error = %error, "Error is non-retryable, stopping");
        }
        final_error
    }

    async fn execute_wait_and_retry<F, Fut, T>(&self, wait: Duration, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match operation().await {
            Ok(v) => Ok(v),
            Err(e) if self.is_final(&e) => Err(e),
            Err(e) => {
                if self.log_retries {
                    warn!(wait_ms = wait.as_millis() as u64, error = %e, "Operation failed, waiting before retry");
                }
                sleep(wait).await;
                operation().await
            }
        }
    }

    async fn execute_exponential_backoff<F, Fut, T>(
        &self,
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = base_delay;
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(v) => {
                    if attempts > 1 && self.log_retries {
                        info!(attempts, "Operation succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        if self.log_retries {
                            warn!(attempts, error = %e, "Operation failed, giving up");
                        }
                        return Err(e);
                    }
                    if self.is_final(&e) {
                        return Err(e);
                    }

                    if self.log_retries {
                        warn!(
                            attempt = attempts,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Attempt failed, retrying"
                        );
                    }

                    sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }
}
