//! Circuit breaker implementation with lock-free atomics
//!
//! One breaker guards one named resource. State lives behind an `Arc`, so every clone of a
//! [`CircuitBreaker`] observes and drives the same lifecycle:
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected with [`ResilienceError::CircuitOpen`] without running.
//! - **HalfOpen**: exactly one trial call is let through; success closes the breaker, failure
//!   reopens it and restarts the reset timeout.
//!
//! The Open → HalfOpen move happens lazily, on the first call after `reset_timeout` has passed
//! since the last recorded failure. There is no background timer.

use crate::clock::{Clock, MonotonicClock};
use crate::{CallContext, ConfigError, ResilienceError};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// Probe mode allowing a single trial call to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked on every state change with `(resource, from, to)`.
pub type StateObserver = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Handle returned by [`CircuitBreaker::add_observer`], used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Point-in-time counters for one breaker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Calls that were allowed to run.
    pub admitted: u64,
    /// Calls rejected while Open or while a trial was in flight.
    pub rejected: u64,
    /// Number of transitions into Open.
    pub tripped: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: usize,
}

struct BreakerShared {
    name: Arc<str>,
    state: AtomicU8,
    failure_count: AtomicUsize,
    last_failure_nanos: AtomicU64,
    trial_in_flight: AtomicBool,
    admitted: AtomicU64,
    rejected: AtomicU64,
    tripped: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    observers: RwLock<Vec<(ObserverId, StateObserver)>>,
    next_observer: AtomicU64,
}

impl fmt::Debug for BreakerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerShared")
            .field("name", &self.name)
            .field("state", &CircuitState::from_u8(self.state.load(Ordering::Relaxed)))
            .field("failure_count", &self.failure_count.load(Ordering::Relaxed))
            .field("trial_in_flight", &self.trial_in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Releases the half-open trial slot on every exit path, including drop on cancellation.
struct TrialGuard<'a> {
    shared: &'a BreakerShared,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        self.shared.trial_in_flight.store(false, Ordering::Release);
    }
}

/// Circuit breaker guarding an async operation.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and affect the
/// same circuit lifecycle (failure counts, open/half-open/closed transitions, observers).
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<BreakerShared>,
    failure_threshold: usize,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a circuit breaker for `name`, validating the threshold and timeout.
    ///
    /// # Examples
    /// ```
    /// use floodgate::CircuitBreaker;
    /// use std::time::Duration;
    /// let breaker = CircuitBreaker::new("payments", 5, Duration::from_secs(30)).unwrap();
    /// assert_eq!(breaker.name(), "payments");
    /// ```
    pub fn new(
        name: impl Into<Arc<str>>,
        failure_threshold: usize,
        reset_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold { provided: failure_threshold });
        }
        if reset_timeout.is_zero() {
            return Err(ConfigError::InvalidResetTimeout(reset_timeout));
        }
        Ok(Self {
            shared: Self::new_shared(name.into()),
            failure_threshold,
            reset_timeout,
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    fn new_shared(name: Arc<str>) -> Arc<BreakerShared> {
        Arc::new(BreakerShared {
            name,
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            failure_count: AtomicUsize::new(0),
            last_failure_nanos: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            tripped: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(0),
        })
    }

    /// A breaker with this one's settings, clock and observers but independent state.
    pub(crate) fn sibling(&self, name: impl Into<Arc<str>>) -> Self {
        let shared = Self::new_shared(name.into());
        if let (Ok(mut dst), Ok(src)) = (shared.observers.write(), self.shared.observers.read()) {
            dst.extend(src.iter().cloned());
        }
        let next = self.shared.next_observer.load(Ordering::Relaxed);
        shared.next_observer.store(next, Ordering::Relaxed);
        Self {
            shared,
            failure_threshold: self.failure_threshold,
            reset_timeout: self.reset_timeout,
            clock: self.clock.clone(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a state-change observer. Visible to every clone of this breaker.
    pub fn with_observer(self, observer: StateObserver) -> Self {
        self.add_observer(observer);
        self
    }

    pub fn add_observer(&self, observer: StateObserver) -> ObserverId {
        let id = ObserverId(self.shared.next_observer.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.shared.observers.write() {
            observers.push((id, observer));
        }
        id
    }

    /// Unregister an observer. Returns `false` if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let Ok(mut observers) = self.shared.observers.write() else { return false };
        let before = observers.len();
        observers.retain(|(registered, _)| *registered != id);
        observers.len() != before
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.shared.observers.read().map_or(0, |observers| observers.len())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Force the breaker back to Closed and clear its failure streak.
    pub fn reset(&self) {
        let previous = self.shared.state.swap(CircuitState::Closed.to_u8(), Ordering::AcqRel);
        self.shared.failure_count.store(0, Ordering::Release);
        self.shared.trial_in_flight.store(false, Ordering::Release);
        let previous = CircuitState::from_u8(previous);
        if previous != CircuitState::Closed {
            tracing::info!(resource = %self.shared.name, from = %previous, "circuit breaker reset");
            self.notify(previous, CircuitState::Closed);
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let s = &self.shared;
        BreakerStats {
            name: s.name.to_string(),
            state: self.state(),
            admitted: s.admitted.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            tripped: s.tripped.load(Ordering::Relaxed),
            successes: s.successes.load(Ordering::Relaxed),
            failures: s.failures.load(Ordering::Relaxed),
            consecutive_failures: s.failure_count.load(Ordering::Relaxed),
        }
    }

    /// Executes the provided async operation under circuit breaker protection.
    ///
    /// # Behavior
    /// - **Closed**: runs the operation. Consecutive failures increment the failure count.
    /// - **Open**: rejects with `ResilienceError::CircuitOpen` until `reset_timeout` elapses.
    /// - **HalfOpen**: admits a single trial. Success closes the circuit; failure reopens it.
    ///
    /// `ResilienceError::Cancelled` from the operation (or from `ctx` firing while it runs)
    /// is neutral: no transition, and a held trial slot is released. Every other error counts
    /// as a failure.
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
        let trial = self.admit::<E>()?;
        self.shared.admitted.fetch_add(1, Ordering::Relaxed);
        let is_trial = trial.is_some();

        let result = match ctx.run(operation()).await {
            Ok(result) => result,
            Err(reason) => Err(ResilienceError::Cancelled(reason)),
        };

        match &result {
            Ok(_) => self.on_success(is_trial),
            Err(ResilienceError::Cancelled(_)) => {
                tracing::debug!(resource = %self.shared.name, is_trial, "call cancelled; breaker unchanged");
            }
            Err(_) => self.on_failure(is_trial),
        }
        drop(trial);
        result
    }

    /// Decide whether a call may run. `Some(guard)` marks the half-open trial.
    fn admit<E>(&self) -> Result<Option<TrialGuard<'_>>, ResilienceError<E>> {
        loop {
            match self.state() {
                CircuitState::Closed => return Ok(None),
                CircuitState::Open => {
                    let elapsed = self.since_last_failure();
                    if elapsed < self.reset_timeout {
                        return Err(self.reject(elapsed));
                    }
                    let Some(guard) = self.try_take_trial() else {
                        return Err(self.reject(elapsed));
                    };
                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!(resource = %self.shared.name, "circuit breaker → half-open");
                            self.notify(CircuitState::Open, CircuitState::HalfOpen);
                            return Ok(Some(guard));
                        }
                        // Someone else moved the state (reset or a finished trial); re-check.
                        Err(_) => {
                            drop(guard);
                            continue;
                        }
                    }
                }
                CircuitState::HalfOpen => {
                    return match self.try_take_trial() {
                        Some(guard) => {
                            tracing::debug!(resource = %self.shared.name, "circuit breaker: half-open trial");
                            Ok(Some(guard))
                        }
                        None => Err(self.reject(self.since_last_failure())),
                    };
                }
            }
        }
    }

    fn try_take_trial(&self) -> Option<TrialGuard<'_>> {
        self.shared
            .trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TrialGuard { shared: &self.shared })
    }

    fn reject<E>(&self, open_for: Duration) -> ResilienceError<E> {
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(resource = %self.shared.name, ?open_for, "circuit breaker rejected call");
        ResilienceError::CircuitOpen { resource: self.shared.name.to_string(), open_for }
    }

    /// Any success in the closed state resets the counter to 0, so only consecutive failures
    /// trip the breaker (F-F-S-F-F does not open it with a threshold of 3).
    fn on_success(&self, is_trial: bool) {
        self.shared.successes.fetch_add(1, Ordering::Relaxed);
        if is_trial {
            if self
                .shared
                .state
                .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.shared.failure_count.store(0, Ordering::Release);
                tracing::info!(resource = %self.shared.name, "circuit breaker → closed");
                self.notify(CircuitState::HalfOpen, CircuitState::Closed);
            }
        } else if self.state() == CircuitState::Closed {
            self.shared.failure_count.store(0, Ordering::Release);
        }
    }

    fn on_failure(&self, is_trial: bool) {
        self.shared.failures.fetch_add(1, Ordering::Relaxed);
        // The timestamp is published before any transition so a reader that sees Open also
        // sees the matching failure time.
        self.shared.last_failure_nanos.store(self.clock.now_nanos(), Ordering::Release);

        if is_trial {
            if self
                .shared
                .state
                .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.shared.tripped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(resource = %self.shared.name, "circuit breaker: trial failed → open");
                self.notify(CircuitState::HalfOpen, CircuitState::Open);
            }
            return;
        }

        if self.state() != CircuitState::Closed {
            return;
        }
        let failures = self.shared.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold
            && self
                .shared
                .state
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.shared.tripped.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                resource = %self.shared.name,
                failures,
                threshold = self.failure_threshold,
                "circuit breaker → open"
            );
            self.notify(CircuitState::Closed, CircuitState::Open);
        }
    }

    fn since_last_failure(&self) -> Duration {
        let last = self.shared.last_failure_nanos.load(Ordering::Acquire);
        Duration::from_nanos(self.clock.now_nanos().saturating_sub(last))
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        // Snapshot so an observer may register further observers without deadlocking.
        let observers = match self.shared.observers.read() {
            Ok(observers) => observers.clone(),
            Err(_) => return,
        };
        for (_, observer) in observers {
            observer(&self.shared.name, from, to);
        }
    }

    #[cfg(test)]
    fn trial_in_flight(&self) -> bool {
        self.shared.trial_in_flight.load(Ordering::Acquire)
    }
}
