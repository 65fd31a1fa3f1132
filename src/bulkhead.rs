//! Bulkhead implementation for concurrency limiting
//!
//! Admission is a non-blocking `try_acquire` on a semaphore: a call either takes a permit
//! immediately or is rejected with [`ResilienceError::BulkheadFull`]. Nothing is queued. The
//! permit is held by the executing future, so it is returned on success, error, panic and when
//! the caller's context cancels the call.

use crate::{CallContext, ConfigError, ResilienceError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Point-in-time counters for one bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BulkheadStats {
    pub name: String,
    pub max_concurrent: usize,
    pub active: usize,
    pub admitted: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct Counters {
    admitted: AtomicU64,
    rejected: AtomicU64,
}

/// Fixed-capacity concurrency gate for one named resource. Clones share the same permits.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    name: Arc<str>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    counters: Arc<Counters>,
}

impl Bulkhead {
    /// A bulkhead admitting at most `max_concurrent` calls at once.
    pub fn new(name: impl Into<Arc<str>>, max_concurrent: usize) -> Result<Self, ConfigError> {
        if max_concurrent == 0 {
            return Err(ConfigError::ZeroCapacity { what: "bulkhead" });
        }
        let max_concurrent = max_concurrent.min(Semaphore::MAX_PERMITS);
        Ok(Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            counters: Arc::new(Counters { admitted: AtomicU64::new(0), rejected: AtomicU64::new(0) }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Calls currently holding a permit.
    pub fn active(&self) -> usize {
        self.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            name: self.name.to_string(),
            max_concurrent: self.max_concurrent,
            active: self.active(),
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Run `operation` if a slot is free, otherwise fail fast with `BulkheadFull`.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &CallContext,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        ctx.check()?;
        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    resource = %self.name,
                    max_concurrent = self.max_concurrent,
                    "bulkhead full; call rejected"
                );
                return Err(ResilienceError::BulkheadFull {
                    resource: self.name.to_string(),
                    max_concurrent: self.max_concurrent,
                });
            }
        };
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);

        let result = ctx.run(operation()).await;
        drop(permit);
        result.unwrap_or_else(|reason| Err(ResilienceError::Cancelled(reason)))
    }
}
