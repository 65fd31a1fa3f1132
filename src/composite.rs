//! The composite pipeline: every primitive around one protected call.
//!
//! Stage order is fixed:
//!
//! ```text
//! Bulkhead( RateLimiter gate( Retry( CircuitBreaker( operation ) ) ) )
//! ```
//!
//! Admission (bulkhead, rate limit) happens once per call, outside the retry loop, so a
//! rejected call never spends retry budget or quota. The breaker sits inside the loop and is
//! consulted on every attempt; a `CircuitOpen` rejection ends the loop immediately because the
//! retry executor never retries admission errors. Any stage may be left out.
//!
//! Each stage decision becomes a [`ResilienceEvent`]. Every call buffers its own events as
//! they happen and delivers them to the sink before each attempt and when it finishes, so a
//! slow or failing sink never delays an admission decision. Breaker transitions are attributed
//! to the next call that records an event after them.

use crate::bulkhead::{Bulkhead, BulkheadStats};
use crate::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitState, ObserverId};
use crate::config::CompositeConfig;
use crate::rate_limit::{build_limiter, CleanupTask, LimiterStats, RateLimiter, WindowStore};
use crate::retry::{RetryNotice, RetryStats};
use crate::telemetry::{emit_best_effort, EventKind, EventSink, NullSink, ResilienceEvent, Stage};
use crate::{CallContext, ConfigError, ResilienceError, RetryExecutor};
use std::future::Future;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

/// Aggregated counters for the pipeline and each configured stage.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CompositeStats {
    pub resource: String,
    pub executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub bulkhead: Option<BulkheadStats>,
    pub rate_limiter: Option<LimiterStats>,
    pub circuit_breaker: Option<BreakerStats>,
    pub retry: Option<RetryStats>,
}

impl CompositeStats {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Counters {
    executions: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Breaker transitions not yet claimed by a call. Oldest entries are dropped past this.
const MAX_PENDING_TRANSITIONS: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Breaker transitions waiting to be attributed to a call.
#[derive(Debug, Default)]
struct Transitions {
    events: Mutex<VecDeque<ResilienceEvent>>,
}

impl Transitions {
    fn push(&self, event: ResilienceEvent) {
        let mut events = lock(&self.events);
        if events.len() == MAX_PENDING_TRANSITIONS {
            events.pop_front();
            tracing::trace!("dropped an unclaimed circuit breaker transition");
        }
        events.push_back(event);
    }

    fn drain_into(&self, out: &mut Vec<ResilienceEvent>) {
        out.extend(lock(&self.events).drain(..));
    }
}

/// Events produced by one call, in the order they happened.
struct CallEvents<'a> {
    resource: &'a Arc<str>,
    transitions: &'a Transitions,
    events: Mutex<Vec<ResilienceEvent>>,
}

impl<'a> CallEvents<'a> {
    fn new(resource: &'a Arc<str>, transitions: &'a Transitions) -> Self {
        Self { resource, transitions, events: Mutex::new(Vec::new()) }
    }

    fn record(&self, kind: EventKind) {
        let mut events = lock(&self.events);
        self.transitions.drain_into(&mut events);
        events.push(ResilienceEvent::new(self.resource.clone(), kind));
    }

    fn take(&self) -> Vec<ResilienceEvent> {
        let mut events = lock(&self.events);
        self.transitions.drain_into(&mut events);
        std::mem::take(&mut *events)
    }
}

/// Unregisters the executor's breaker observer when the last clone of the executor is dropped.
#[derive(Debug)]
struct ObserverRegistration {
    breaker: CircuitBreaker,
    id: ObserverId,
}

impl Drop for ObserverRegistration {
    fn drop(&mut self) {
        self.breaker.remove_observer(self.id);
    }
}

fn reason<E>(err: &ResilienceError<E>) -> &'static str {
    match err {
        ResilienceError::RateLimited { .. } => "rate_limited",
        ResilienceError::CircuitOpen { .. } => "circuit_open",
        ResilienceError::BulkheadFull { .. } => "bulkhead_full",
        ResilienceError::RetryExhausted { .. } => "retry_exhausted",
        ResilienceError::Cancelled(_) => "cancelled",
        ResilienceError::Store(_) => "store_unavailable",
        ResilienceError::Inner(_) => "operation_failed",
    }
}

/// Runs operations through the configured stages and reports what happened to `S`.
pub struct CompositeExecutor<E, S = NullSink> {
    resource: Arc<str>,
    bulkhead: Option<Bulkhead>,
    limiter: Option<Arc<dyn RateLimiter>>,
    retry: Option<RetryExecutor<E>>,
    breaker: Option<CircuitBreaker>,
    sink: S,
    transitions: Arc<Transitions>,
    registration: Option<Arc<ObserverRegistration>>,
    counters: Arc<Counters>,
}

impl<E, S: Clone> Clone for CompositeExecutor<E, S> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            bulkhead: self.bulkhead.clone(),
            limiter: self.limiter.clone(),
            retry: self.retry.clone(),
            breaker: self.breaker.clone(),
            sink: self.sink.clone(),
            transitions: self.transitions.clone(),
            registration: self.registration.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<E, S> std::fmt::Debug for CompositeExecutor<E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeExecutor")
            .field("resource", &self.resource)
            .field("bulkhead", &self.bulkhead)
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl<E> CompositeExecutor<E, NullSink> {
    pub fn builder() -> CompositeExecutorBuilder<E, NullSink> {
        CompositeExecutorBuilder::new()
    }
}

impl<E, S> CompositeExecutor<E, S>
where
    S: EventSink,
    S::Future: Send + 'static,
{
    /// Build every stage named in `config`. `store` backs a distributed limiter and is
    /// ignored otherwise.
    pub fn from_config(
        config: &CompositeConfig,
        store: Option<Arc<dyn WindowStore>>,
        sink: S,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let resource = config.resource.as_str();
        let stage_name = |name: &str| if name.is_empty() { resource.to_string() } else { name.to_string() };

        let mut builder = CompositeExecutor::<E, NullSink>::builder().resource(resource).sink(sink);
        if let Some(bulkhead) = &config.bulkhead {
            builder = builder.bulkhead(Bulkhead::new(stage_name(&bulkhead.name), bulkhead.max_concurrent)?);
        }
        if let Some(limiter) = &config.limiter {
            builder = builder.rate_limiter(build_limiter(limiter, store)?);
        }
        if let Some(retry) = &config.retry {
            builder = builder.retry(RetryExecutor::from_config(retry)?);
        }
        if let Some(breaker) = &config.breaker {
            builder = builder.circuit_breaker(CircuitBreaker::new(
                stage_name(&breaker.name),
                breaker.failure_threshold,
                breaker.reset_timeout(),
            )?);
        }
        Ok(builder.build())
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&Arc<dyn RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Sweep idle identities out of the rate limiter at its own interval. `None` without a
    /// limiter. Must be called inside a tokio runtime.
    pub fn spawn_limiter_cleanup(&self) -> Option<CleanupTask> {
        self.limiter.as_ref().map(|limiter| CleanupTask::spawn_default(limiter))
    }

    pub fn stats(&self) -> CompositeStats {
        CompositeStats {
            resource: self.resource.to_string(),
            executions: self.counters.executions.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            bulkhead: self.bulkhead.as_ref().map(Bulkhead::stats),
            rate_limiter: self.limiter.as_ref().map(|l| l.stats()),
            circuit_breaker: self.breaker.as_ref().map(CircuitBreaker::stats),
            retry: self.retry.as_ref().map(RetryExecutor::stats),
        }
    }

    /// Run `operation`, rate limited against the executor's resource name.
    pub async fn execute<T, Fut, Op>(
        &self,
        ctx: &CallContext,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let resource = self.resource.clone();
        self.execute_for(ctx, &resource, operation).await
    }

    /// Run `operation`, rate limited against `identity` (a client IP, a user id, ...).
    pub async fn execute_for<T, Fut, Op>(
        &self,
        ctx: &CallContext,
        identity: &str,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let events = CallEvents::new(&self.resource, &self.transitions);
        let events = &events;

        let result = match &self.bulkhead {
            Some(bulkhead) => {
                let mut entered = false;
                let entered_flag = &mut entered;
                let result = bulkhead
                    .execute(ctx, move || {
                        *entered_flag = true;
                        events.record(EventKind::Admitted { stage: Stage::Bulkhead });
                        self.admitted(events, ctx, identity, operation)
                    })
                    .await;
                if !entered {
                    if let Err(e) = &result {
                        reject(events, Stage::Bulkhead, e);
                    }
                }
                result
            }
            None => self.admitted(events, ctx, identity, operation).await,
        };

        let success = result.is_ok();
        let counter = if success { &self.counters.succeeded } else { &self.counters.failed };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = &result {
            tracing::debug!(resource = %self.resource, identity, reason = reason(e), "composite call failed");
        }
        events.record(EventKind::Completed { success, duration: started.elapsed() });
        self.flush(events).await;
        result
    }

    /// Everything inside the bulkhead: the rate limit gate, then the retry loop.
    async fn admitted<T, Fut, Op>(
        &self,
        events: &CallEvents<'_>,
        ctx: &CallContext,
        identity: &str,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        if let Some(limiter) = &self.limiter {
            if let Err(e) = limiter.allow(ctx, identity).await {
                let err = ResilienceError::from(e);
                reject(events, Stage::RateLimiter, &err);
                return Err(err);
            }
            events.record(EventKind::Admitted { stage: Stage::RateLimiter });
        }

        let result = self.retried(events, ctx, operation).await;

        if let Some(limiter) = &self.limiter {
            if !matches!(result, Err(ResilienceError::Cancelled(_))) {
                limiter.record_outcome(result.is_ok());
            }
        }
        result
    }

    async fn retried<T, Fut, Op>(
        &self,
        events: &CallEvents<'_>,
        ctx: &CallContext,
        mut operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let Some(retry) = &self.retry else {
            return self.attempt(events, ctx, operation()).await;
        };
        retry
            .execute_observed(
                ctx,
                || self.attempt(events, ctx, operation()),
                |notice| {
                    events.record(match notice {
                        RetryNotice::Retrying { attempt, delay } => EventKind::Retry { attempt, delay },
                        RetryNotice::Exhausted { attempts } => EventKind::RetryExhausted { attempts },
                    })
                },
            )
            .await
    }

    /// One attempt through the circuit breaker.
    async fn attempt<T, Fut>(
        &self,
        events: &CallEvents<'_>,
        ctx: &CallContext,
        call: Fut,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.flush(events).await;
        let Some(breaker) = &self.breaker else {
            return ctx.run(call).await.unwrap_or_else(|reason| Err(ResilienceError::Cancelled(reason)));
        };

        let mut entered = false;
        let entered_flag = &mut entered;
        let result = breaker
            .execute(ctx, move || {
                *entered_flag = true;
                events.record(EventKind::Admitted { stage: Stage::CircuitBreaker });
                call
            })
            .await;
        if !entered {
            if let Err(e) = &result {
                reject(events, Stage::CircuitBreaker, e);
            }
        }
        result
    }

    async fn flush(&self, events: &CallEvents<'_>) {
        for event in events.take() {
            emit_best_effort(self.sink.clone(), event).await;
        }
    }
}

fn reject<E>(events: &CallEvents<'_>, stage: Stage, err: &ResilienceError<E>) {
    events.record(EventKind::Rejection { stage, reason: reason(err).to_string() });
}

/// Builder for [`CompositeExecutor`]. Every stage is optional.
pub struct CompositeExecutorBuilder<E, S = NullSink> {
    resource: Arc<str>,
    bulkhead: Option<Bulkhead>,
    limiter: Option<Arc<dyn RateLimiter>>,
    retry: Option<RetryExecutor<E>>,
    breaker: Option<CircuitBreaker>,
    sink: S,
}

impl<E> CompositeExecutorBuilder<E, NullSink> {
    pub fn new() -> Self {
        Self {
            resource: Arc::from("default"),
            bulkhead: None,
            limiter: None,
            retry: None,
            breaker: None,
            sink: NullSink,
        }
    }
}

impl<E> Default for CompositeExecutorBuilder<E, NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, S> CompositeExecutorBuilder<E, S> {
    /// Name used in events and as the rate limit identity for [`CompositeExecutor::execute`].
    pub fn resource(mut self, resource: impl Into<Arc<str>>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn retry(mut self, retry: RetryExecutor<E>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn sink<S2>(self, sink: S2) -> CompositeExecutorBuilder<E, S2> {
        CompositeExecutorBuilder {
            resource: self.resource,
            bulkhead: self.bulkhead,
            limiter: self.limiter,
            retry: self.retry,
            breaker: self.breaker,
            sink,
        }
    }

    pub fn build(self) -> CompositeExecutor<E, S> {
        let transitions = Arc::new(Transitions::default());
        let registration = self.breaker.as_ref().map(|breaker| {
            let events: Weak<Transitions> = Arc::downgrade(&transitions);
            let resource = self.resource.clone();
            let threshold = breaker.failure_threshold();
            let id = breaker.add_observer(Arc::new(move |_name: &str, from, to| {
                let Some(events) = events.upgrade() else { return };
                if to == CircuitState::Open {
                    let failures = if from == CircuitState::HalfOpen { 1 } else { threshold };
                    events.push(ResilienceEvent::new(resource.clone(), EventKind::Trip { failures }));
                }
                events.push(ResilienceEvent::new(resource.clone(), EventKind::StateChange { from, to }));
            }));
            Arc::new(ObserverRegistration { breaker: breaker.clone(), id })
        });
        CompositeExecutor {
            resource: self.resource,
            bulkhead: self.bulkhead,
            limiter: self.limiter,
            retry: self.retry,
            breaker: self.breaker,
            sink: self.sink,
            transitions,
            registration,
            counters: Arc::new(Counters::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, BulkheadConfig, LimiterConfig, RetryConfig};
    use crate::rate_limit::{LimiterKind, TokenBucket};
    use crate::telemetry::MemorySink;
    use crate::{Backoff, InstantSleeper};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl std::error::Error for TestError {}

    type Outcome = Result<u32, ResilienceError<TestError>>;

    fn retry(attempts: usize) -> RetryExecutor<TestError> {
        RetryExecutor::builder()
            .max_attempts(attempts)
            .backoff(Backoff::constant(Duration::from_millis(10)))
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap()
    }

    fn kinds(sink: &MemorySink) -> Vec<String> {
        sink.events()
            .iter()
            .map(|e| match &e.kind {
                EventKind::Admitted { stage } => format!("admitted:{stage}"),
                EventKind::Rejection { stage, reason } => format!("rejected:{stage}:{reason}"),
                EventKind::Completed { success: true, .. } => "completed:ok".to_string(),
                _ => e.kind_name().to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn full_bulkhead_never_reaches_limiter_or_retry() {
        let bulkhead = Bulkhead::new("db", 1).unwrap();
        let limiter = Arc::new(TokenBucket::new(10, Duration::from_secs(1), 10).unwrap());
        let retry = retry(3);
        let sink = MemorySink::new();
        let executor = CompositeExecutor::<TestError>::builder()
            .resource("db")
            .bulkhead(bulkhead.clone())
            .rate_limiter(limiter.clone())
            .retry(retry.clone())
            .sink(sink.clone())
            .build();

        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let holder = tokio::spawn(async move {
            let r: Outcome = bulkhead
                .execute(&CallContext::background(), move || async move {
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                    Ok(0)
                })
                .await;
            r
        });
        entered_rx.await.unwrap();

        let invoked = AtomicUsize::new(0);
        let counter = &invoked;
        let result: Outcome = executor
            .execute(&CallContext::background(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(result.unwrap_err().is_bulkhead_full());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        let limiter_stats = limiter.stats();
        assert_eq!(limiter_stats.admitted + limiter_stats.rejected, 0, "no quota consumed");
        assert_eq!(retry.stats().executions, 0, "no attempts recorded");
        assert_eq!(kinds(&sink), vec!["rejected:bulkhead:bulkhead_full", "completed"]);

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn success_emits_each_stage_in_order() {
        let sink = MemorySink::new();
        let executor = CompositeExecutor::<TestError>::builder()
            .resource("api")
            .bulkhead(Bulkhead::new("api", 2).unwrap())
            .rate_limiter(Arc::new(TokenBucket::new(5, Duration::from_secs(1), 5).unwrap()))
            .retry(retry(3))
            .circuit_breaker(CircuitBreaker::new("api", 3, Duration::from_secs(1)).unwrap())
            .sink(sink.clone())
            .build();

        let result: Outcome = executor.execute(&CallContext::background(), || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(
            kinds(&sink),
            vec![
                "admitted:bulkhead",
                "admitted:rate_limiter",
                "admitted:circuit_breaker",
                "completed:ok"
            ]
        );
        assert!(sink.events().iter().all(|e| &*e.resource == "api"));
    }

    #[tokio::test]
    async fn rate_limited_call_spends_no_retry_budget() {
        let retry = retry(3);
        let executor = CompositeExecutor::<TestError>::builder()
            .rate_limiter(Arc::new(TokenBucket::new(1, Duration::from_secs(60), 1).unwrap()))
            .retry(retry.clone())
            .build();
        let ctx = CallContext::background();

        let first: Outcome = executor.execute_for(&ctx, "alice", || async { Ok(1) }).await;
        assert!(first.is_ok());
        let second: Outcome = executor.execute_for(&ctx, "alice", || async { Ok(1) }).await;
        let err = second.unwrap_err();
        assert!(err.is_rate_limited());
        assert!(err.retry_after().is_some());
        let third: Outcome = executor.execute_for(&ctx, "bob", || async { Ok(1) }).await;
        assert!(third.is_ok(), "identities are limited separately");

        assert_eq!(retry.stats().executions, 2);
        let stats = executor.stats();
        assert_eq!((stats.executions, stats.succeeded, stats.failed), (3, 2, 1));
    }

    #[tokio::test]
    async fn open_breaker_stops_the_retry_loop() {
        let sink = MemorySink::new();
        let executor = CompositeExecutor::<TestError>::builder()
            .resource("flaky")
            .retry(retry(5))
            .circuit_breaker(CircuitBreaker::new("flaky", 2, Duration::from_secs(60)).unwrap())
            .sink(sink.clone())
            .build();

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Outcome = executor
            .execute(&CallContext::background(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Inner(TestError("down")))
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            kinds(&sink),
            vec![
                "admitted:circuit_breaker",
                "retry",
                "admitted:circuit_breaker",
                "trip",
                "state_change",
                "retry",
                "rejected:circuit_breaker:circuit_open",
                "completed",
            ]
        );
        let trip = sink.events().into_iter().find(|e| e.kind_name() == "trip").unwrap();
        assert_eq!(trip.kind, EventKind::Trip { failures: 2 });
    }

    #[tokio::test]
    async fn inner_errors_exhaust_retries() {
        let executor = CompositeExecutor::<TestError>::builder().retry(retry(3)).build();
        let result: Outcome = executor
            .execute(&CallContext::background(), || async { Err(ResilienceError::Inner(TestError("x"))) })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.last_error(), Some(&TestError("x")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_the_bulkhead() {
        let executor = CompositeExecutor::<TestError>::builder()
            .bulkhead(Bulkhead::new("slow", 1).unwrap())
            .retry(retry(3))
            .build();
        let ctx = CallContext::with_timeout(Duration::from_millis(20));
        let result: Outcome = executor
            .execute(&ctx, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(executor.bulkhead().unwrap().available(), 1);
    }

    #[tokio::test]
    async fn from_config_builds_all_stages() {
        let config = CompositeConfig {
            resource: "orders".into(),
            limiter: Some(LimiterConfig::new(LimiterKind::SlidingWindow, 10, Duration::from_secs(1))),
            breaker: Some(BreakerConfig { failure_threshold: 2, ..BreakerConfig::default() }),
            bulkhead: Some(BulkheadConfig { name: String::new(), max_concurrent: 3 }),
            retry: Some(RetryConfig { max_attempts: 2, initial_interval_ms: 1, max_interval_ms: 1, multiplier: 1.0 }),
        };
        let executor =
            CompositeExecutor::<TestError, _>::from_config(&config, None, MemorySink::new()).unwrap();
        assert_eq!(executor.circuit_breaker().unwrap().name(), "orders");
        assert_eq!(executor.bulkhead().unwrap().name(), "orders");

        let result: Outcome = executor.execute(&CallContext::background(), || async { Ok(3) }).await;
        assert_eq!(result.unwrap(), 3);

        let json = executor.stats().to_json();
        assert_eq!(json["resource"], "orders");
        assert_eq!(json["executions"], 1);
        assert_eq!(json["rate_limiter"]["algorithm"], "sliding_window");
        assert_eq!(json["circuit_breaker"]["state"], "closed");
        assert_eq!(json["bulkhead"]["max_concurrent"], 3);
        assert_eq!(json["retry"]["executions"], 1);
    }

    #[tokio::test]
    async fn dropped_executors_unregister_from_a_shared_breaker() {
        let breaker = CircuitBreaker::new("shared", 1, Duration::from_secs(60)).unwrap();
        for _ in 0..50 {
            let executor = CompositeExecutor::<TestError>::builder()
                .resource("shared")
                .circuit_breaker(breaker.clone())
                .build();
            let copy = executor.clone();
            drop(executor);
            assert_eq!(breaker.observer_count(), 1, "a live clone keeps the observer");
            drop(copy);
        }
        assert_eq!(breaker.observer_count(), 0);

        let idle = CompositeExecutor::<TestError>::builder()
            .resource("shared")
            .circuit_breaker(breaker.clone())
            .build();
        for _ in 0..100 {
            let _: Outcome = breaker
                .execute(&CallContext::background(), || async {
                    Err(ResilienceError::Inner(TestError("down")))
                })
                .await;
            breaker.reset();
        }
        assert_eq!(lock(&idle.transitions.events).len(), MAX_PENDING_TRANSITIONS);
    }

    #[tokio::test]
    async fn concurrent_calls_deliver_only_their_own_events() {
        let sink = MemorySink::new();
        let executor = CompositeExecutor::<TestError>::builder()
            .resource("orders")
            .circuit_breaker(CircuitBreaker::new("orders", 3, Duration::from_secs(1)).unwrap())
            .sink(sink.clone())
            .build();

        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let slow = executor.clone();
        let mut entered_tx = Some(entered_tx);
        let mut release_rx = Some(release_rx);
        let held = tokio::spawn(async move {
            let r: Outcome = slow
                .execute(&CallContext::background(), move || {
                    let entered_tx = entered_tx.take().expect("operation invoked once");
                    let release_rx = release_rx.take().expect("operation invoked once");
                    async move {
                        let _ = entered_tx.send(());
                        let _ = release_rx.await;
                        Ok(1)
                    }
                })
                .await;
            r
        });
        entered_rx.await.unwrap();

        let quick: Outcome = executor.execute(&CallContext::background(), || async { Ok(2) }).await;
        assert_eq!(quick.unwrap(), 2);
        assert_eq!(kinds(&sink), vec!["admitted:circuit_breaker", "completed:ok"]);

        release_tx.send(()).unwrap();
        assert_eq!(held.await.unwrap().unwrap(), 1);
        assert_eq!(
            kinds(&sink),
            vec![
                "admitted:circuit_breaker",
                "completed:ok",
                "admitted:circuit_breaker",
                "completed:ok"
            ]
        );
    }

    #[tokio::test]
    async fn config_built_limiter_can_be_swept() {
        let config = CompositeConfig {
            resource: "search".into(),
            limiter: Some(LimiterConfig::new(LimiterKind::FixedWindow, 5, Duration::from_millis(10))),
            breaker: None,
            bulkhead: None,
            retry: None,
        };
        let executor = CompositeExecutor::<TestError, _>::from_config(&config, None, NullSink).unwrap();
        let ctx = CallContext::background();
        for user in ["u1", "u2", "u3"] {
            let r: Outcome = executor.execute_for(&ctx, user, || async { Ok(0) }).await;
            assert!(r.is_ok());
        }
        assert_eq!(executor.stats().rate_limiter.unwrap().tracked_identities, 3);

        let cleanup = executor.spawn_limiter_cleanup().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(executor.stats().rate_limiter.unwrap().tracked_identities, 0);
        cleanup.shutdown().await;

        let bare = CompositeExecutor::<TestError>::builder().build();
        assert!(bare.spawn_limiter_cleanup().is_none());
    }

    #[test]
    fn from_config_rejects_distributed_without_store() {
        let config = CompositeConfig {
            resource: "orders".into(),
            limiter: Some(LimiterConfig::new(LimiterKind::Distributed, 10, Duration::from_secs(1))),
            breaker: None,
            bulkhead: None,
            retry: None,
        };
        let err = CompositeExecutor::<TestError, _>::from_config(&config, None, NullSink).unwrap_err();
        assert_eq!(err, ConfigError::MissingStore);
    }
}
