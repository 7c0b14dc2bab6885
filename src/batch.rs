//! Bounded-concurrency batch execution.
//!
//! Runs one operation per input with at most `concurrency` in flight. The
//! output has the same length and order as the input, whatever order the
//! operations finish in. A failing or panicking item lands as an `Err` at its
//! own index and never cancels its siblings.
//!
//! ```ignore
//! let batch = BatchExecutor::new(4)?;
//! let results = batch
//!     .run(prompts, |prompt| router.generate(Request::from_prompt("", "gpt-4o", prompt)))
//!     .await;
//! ```

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Default number of items in flight.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Order-preserving executor with a concurrency cap.
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor {
    concurrency: usize,
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl BatchExecutor {
    /// Create an executor running at most `concurrency` items at once.
    ///
    /// # Errors
    ///
    /// Returns `Config` when `concurrency` is zero.
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(PipelineError::Config(
                "batch.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self { concurrency })
    }

    /// The concurrency cap.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `f` over every input and collect the results in input order.
    ///
    /// Items complete out of order, so a slow item holds only its own slot.
    pub async fn run<I, T, F, Fut>(&self, inputs: Vec<I>, f: F) -> Vec<Result<T>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total = inputs.len();
        debug!(items = total, concurrency = self.concurrency, "Starting batch");

        let mut indexed: Vec<(usize, Result<T>)> = stream::iter(inputs.into_iter().enumerate())
            .map(|(index, input)| {
                let item = f(input);
                async move {
                    let result = match AssertUnwindSafe(item).catch_unwind().await {
                        Ok(result) => result,
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            warn!(index, panic = %message, "Batch item panicked");
                            Err(PipelineError::Internal(format!(
                                "Batch item {} panicked: {}",
                                index, message
                            )))
                        }
                    };
                    (index, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        indexed.sort_unstable_by_key(|(index, _)| *index);
        let results: Vec<Result<T>> = indexed.into_iter().map(|(_, result)| result).collect();

        let failed = results.iter().filter(|r| r.is_err()).count();
        debug!(items = total, failed, "Batch finished");
        results
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
