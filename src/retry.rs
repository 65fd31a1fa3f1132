//! Retry executor for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total invocations (initial try + retries).
//! - Only `ResilienceError::Inner(E)` values are eligible for retry, and only when the
//!   `should_retry` predicate accepts them. Admission rejections (`RateLimited`, `CircuitOpen`,
//!   `BulkheadFull`), cancellation and store failures are returned immediately: retrying them
//!   would turn a fast failure into a slow one.
//! - After failed attempt `n` the executor waits `min(initial * multiplier^(n-1), max)`,
//!   optionally jittered, through the injected [`Sleeper`]. The wait is raced against the
//!   caller's [`CallContext`]; if the context finishes first the loop stops with `Cancelled`.
//! - Once attempts run out the result is `RetryExhausted { attempts, failures }` holding the
//!   most recent failures (bounded by [`MAX_RETRY_FAILURES`]).
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use floodgate::{Backoff, CallContext, InstantSleeper, ResilienceError, RetryExecutor};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let retry = RetryExecutor::<MyErr>::builder()
//!     .max_attempts(3) // total attempts
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ResilienceError<MyErr>> = retry
//!     .execute(&CallContext::background(), || async { Err(ResilienceError::Inner(MyErr)) })
//!     .await;
//! assert_eq!(result.unwrap_err().attempts(), Some(3));
//! # });
//! ```

use crate::config::RetryConfig;
use crate::error::MAX_RETRY_FAILURES;
use crate::{Backoff, CallContext, ConfigError, Jitter, ResilienceError, Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Progress report handed to an observer while a call is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryNotice {
    /// Attempt `attempt` failed; the next one starts after `delay`.
    Retrying { attempt: usize, delay: Duration },
    /// All `attempts` failed.
    Exhausted { attempts: usize },
}

/// Point-in-time counters for one retry executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct RetryStats {
    /// Calls to `execute`.
    pub executions: u64,
    /// Individual retries scheduled (sleeps started).
    pub retried: u64,
    /// Calls that ended in `RetryExhausted`.
    pub exhausted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    executions: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
}

/// Retry executor combining backoff, jitter, predicate, and sleeper. Clones share counters.
pub struct RetryExecutor<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    counters: Arc<Counters>,
}

impl<E> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry.clone(),
            sleeper: self.sleeper.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryExecutor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryExecutor<E> {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryExecutorBuilder<E> {
        RetryExecutorBuilder::new()
    }

    /// Executor matching a deserialized [`RetryConfig`].
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        Self::builder().max_attempts(config.max_attempts).backoff(config.backoff()?).build()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            executions: self.counters.executions.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(
        &self,
        ctx: &CallContext,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        self.execute_observed(ctx, operation, |_| {}).await
    }

    /// Like [`execute`](Self::execute), reporting each scheduled retry and the final
    /// exhaustion to `observe`.
    pub async fn execute_observed<T, Fut, Op, Obs>(
        &self,
        ctx: &CallContext,
        mut operation: Op,
        mut observe: Obs,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
        Obs: FnMut(RetryNotice),
    {
        ctx.check()?;
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        let mut failures: VecDeque<E> = VecDeque::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match ctx.run(operation()).await {
                Ok(outcome) => outcome,
                Err(reason) => return Err(ResilienceError::Cancelled(reason)),
            };
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) if (self.should_retry)(&e) => e,
                // Fatal inner errors, admission rejections, cancellation and store failures.
                Err(e) => return Err(e),
            };

            failures.push_back(error);
            while failures.len() > MAX_RETRY_FAILURES {
                failures.pop_front();
            }

            if attempt >= self.max_attempts {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(attempts = attempt, "retry attempts exhausted");
                observe(RetryNotice::Exhausted { attempts: attempt });
                return Err(ResilienceError::retry_exhausted(attempt, failures.into()));
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt));
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(attempt, ?delay, "attempt failed; retrying");
            observe(RetryNotice::Retrying { attempt, delay });

            if let Err(reason) = ctx.run(self.sleeper.sleep(delay)).await {
                tracing::debug!(attempt, %reason, "retry wait interrupted");
                return Err(ResilienceError::Cancelled(reason));
            }
        }
    }
}

/// Builder for [`RetryExecutor`].
pub struct RetryExecutorBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryExecutorBuilder<E> {
    /// Three attempts, 1s doubling to 30s, no jitter, every `Inner` error retryable.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: Jitter::None,
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate to decide if an `Inner` error is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the executor, validating inputs.
    pub fn build(self) -> Result<RetryExecutor<E>, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        Ok(RetryExecutor {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            counters: Arc::new(Counters::default()),
        })
    }
}

impl<E> Default for RetryExecutorBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}
