//! Retry executor for fallible async operations.
//!
//! Semantics:
//! - Attempts run `0..=policy.retries()`, so a policy with 3 retries calls the operation at most
//!   4 times.
//! - On failure the error is propagated unchanged when it is the last attempt or when
//!   [`BackoffPolicy::should_retry`] rejects it; otherwise the executor sleeps for
//!   `policy.delay(attempt + 1)` and tries again.
//! - The sleep is the only suspension point besides the operation itself. The executor holds no
//!   locks and no state across calls, so one executor can be shared by any number of callers.
//!
//! Example
//! ```rust
//! use bulwark::{BackoffPolicy, InstantSleeper, ProviderError, RetryExecutor};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let executor = RetryExecutor::with_sleeper(InstantSleeper);
//! let calls = Arc::new(AtomicUsize::new(0));
//! let c = calls.clone();
//! let result: Result<(), ProviderError> = executor
//!     .run(
//!         move || {
//!             let c = c.clone();
//!             async move {
//!                 c.fetch_add(1, Ordering::SeqCst);
//!                 Err(ProviderError::status(500))
//!             }
//!         },
//!         &BackoffPolicy::default_policy(),
//!     )
//!     .await;
//! assert_eq!(result, Err(ProviderError::status(500)));
//! assert_eq!(calls.load(Ordering::SeqCst), 4);
//! # });
//! ```

use crate::backoff::{BackoffPolicy, Classify};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;

/// Applies a [`BackoffPolicy`] around an operation.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    /// Executor sleeping on the tokio timer.
    pub fn new() -> Self {
        Self { sleeper: Arc::new(TokioSleeper) }
    }

    pub fn with_sleeper<S: Sleeper + 'static>(sleeper: S) -> Self {
        Self { sleeper: Arc::new(sleeper) }
    }

    pub fn from_shared(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }

    /// Run `operation` until it succeeds, the policy rejects the failure, or retries run out.
    pub async fn run<T, E, Fut, Op>(&self, mut operation: Op, policy: &BackoffPolicy) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let mut attempt = 0usize;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let signal = err.failure_signal();
                    if attempt >= policy.retries() || !policy.should_retry(attempt, &signal) {
                        return Err(err);
                    }
                    let delay = policy.delay(attempt + 1);
                    tracing::debug!(
                        target: "bulwark::retry",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
