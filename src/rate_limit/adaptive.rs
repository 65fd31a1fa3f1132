//! Load-aware rate limiting.
//!
//! [`AdaptiveLimiter`] counts requests per identity in fixed windows against one shared limit.
//! The limit moves between configured bounds: it shrinks while the observed load is high and
//! grows while it is low, re-evaluated at most once per adjustment interval on the request
//! path (no background task).

use super::cleanup::IdleEviction;
use super::{quota, validate_quota, wait_until, Counters, Decision, LimiterKind, LimiterStats, RateLimiter};
use crate::clock::{duration_nanos, Clock, MonotonicClock};
use crate::config::AdaptiveConfig;
use crate::dynamic::DynamicConfig;
use crate::{CallContext, ConfigError, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Load above this shrinks the limit.
const HIGH_LOAD: f64 = 0.8;
/// Load below this grows the limit.
const LOW_LOAD: f64 = 0.5;
/// Utilisation samples averaged when no external signal is available.
const HISTORY_LEN: usize = 10;

/// External load measurement in `[0, 1]` driving an [`AdaptiveLimiter`].
pub trait LoadSignal: Send + Sync + std::fmt::Debug {
    /// Load since the previous call, or `None` when there is nothing to report yet.
    fn load(&self) -> Option<f64>;

    /// Outcome of an admitted call, for signals that derive load from results.
    fn record(&self, _success: bool) {}
}

/// Error rate of the calls reported since the last reading.
#[derive(Debug, Default)]
pub struct ErrorRateSignal {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ErrorRateSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadSignal for ErrorRateSignal {
    fn load(&self) -> Option<f64> {
        let successes = self.successes.swap(0, Ordering::AcqRel);
        let failures = self.failures.swap(0, Ordering::AcqRel);
        let total = successes + failures;
        (total > 0).then(|| failures as f64 / total as f64)
    }

    fn record(&self, success: bool) {
        let counter = if success { &self.successes } else { &self.failures };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Limit bounds and scale factors; live-updatable through [`AdaptiveLimiter::set_bounds`].
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bounds {
    min: u64,
    max: u64,
    scale_up: f64,
    scale_down: f64,
}

impl Bounds {
    /// The limit after one adjustment step. A step always moves by at least one so small limits
    /// are not stuck by rounding.
    fn next(&self, current: u64, load: f64) -> u64 {
        let next = if load > HIGH_LOAD {
            let scaled = (current as f64 * self.scale_down).floor() as u64;
            scaled.min(current.saturating_sub(1))
        } else if load < LOW_LOAD {
            let scaled = (current as f64 * self.scale_up).floor() as u64;
            scaled.max(current.saturating_add(1))
        } else {
            current
        };
        next.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: u64,
    count: u64,
    last_access: u64,
}

/// Fixed-window limiter whose per-window limit follows a [`LoadSignal`].
///
/// By default the signal is an [`ErrorRateSignal`] fed through
/// [`RateLimiter::record_outcome`]. While it has no samples, the limiter falls back to its own
/// utilisation: the busiest identity's request count over the current limit, averaged over the
/// last ten adjustments.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    windows: DashMap<String, Window>,
    current: AtomicU64,
    bounds: DynamicConfig<Bounds>,
    window_nanos: u64,
    adjust_nanos: u64,
    last_adjust: AtomicU64,
    /// Most requests any identity made in one window since the last adjustment.
    peak: AtomicU64,
    history: Mutex<VecDeque<f64>>,
    /// Serialises limit adjustments with bound updates.
    tuning: Mutex<()>,
    signal: Option<Arc<dyn LoadSignal>>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl AdaptiveLimiter {
    pub fn new(config: &AdaptiveConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Ok(Self {
            windows: DashMap::new(),
            current: AtomicU64::new(config.initial_limit),
            bounds: DynamicConfig::new(Bounds {
                min: config.min_limit,
                max: config.max_limit,
                scale_up: config.scale_up,
                scale_down: config.scale_down,
            }),
            window_nanos: duration_nanos(config.window()),
            adjust_nanos: duration_nanos(config.adjust_interval()),
            last_adjust: AtomicU64::new(clock.now_nanos()),
            peak: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            tuning: Mutex::new(()),
            signal: Some(Arc::new(ErrorRateSignal::new())),
            clock,
            counters: Counters::default(),
        })
    }

    /// Override the clock. Restarts the adjustment interval at the new clock's reading.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.last_adjust = AtomicU64::new(clock.now_nanos());
        self.clock = clock;
        self
    }

    /// Drive the limit from `signal` instead of the built-in error rate.
    pub fn with_signal(mut self, signal: Arc<dyn LoadSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Use only the limiter's own utilisation history.
    pub fn without_signal(mut self) -> Self {
        self.signal = None;
        self
    }

    pub fn current_limit(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn bounds(&self) -> (u64, u64) {
        let bounds = self.bounds.get();
        (bounds.min, bounds.max)
    }

    /// Retune the bounds at runtime. The current limit is pulled inside the new bounds.
    pub fn set_bounds(&self, min: u64, max: u64) -> Result<(), ConfigError> {
        if min == 0 || min > max {
            return Err(ConfigError::InvalidAdaptiveBounds { min, max, initial: self.current_limit() });
        }
        validate_quota(max)?;
        let _tuning = self.tuning.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.bounds.update(|b| Bounds { min, max, ..*b });
        let _ = self.current.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            Some(cur.clamp(min, max))
        });
        tracing::info!(min, max, limit = self.current_limit(), "adaptive bounds updated");
        Ok(())
    }

    /// Re-evaluate the limit if the adjustment interval has passed. Only one caller per
    /// interval wins the compare-exchange and does the work.
    fn maybe_adjust(&self, now: u64) {
        let last = self.last_adjust.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.adjust_nanos {
            return;
        }
        if self
            .last_adjust
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let _tuning = self.tuning.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.current_limit();
        let peak = self.peak.swap(0, Ordering::AcqRel);
        let load = match self.signal.as_ref().and_then(|s| s.load()) {
            Some(load) => load,
            None => self.utilisation(peak as f64 / current.max(1) as f64),
        };

        // Bounds are read under the lock, so a concurrent `set_bounds` is never undone.
        let next = self.bounds.get().next(current, load);
        if next != current {
            self.current.store(next, Ordering::Release);
            tracing::info!(from = current, to = next, load, "adaptive limit adjusted");
        }
    }

    fn utilisation(&self, sample: f64) -> f64 {
        let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(sample);
        history.iter().sum::<f64>() / history.len() as f64
    }

    fn decide(&self, identity: &str, now: u64) -> Decision {
        self.maybe_adjust(now);
        let limit = self.current_limit();

        let mut window = self
            .windows
            .entry(identity.to_string())
            .or_insert(Window { start: now, count: 0, last_access: now });
        if now.saturating_sub(window.start) >= self.window_nanos {
            window.start = now;
            window.count = 0;
        }
        window.last_access = now;
        self.peak.fetch_max(window.count + 1, Ordering::AcqRel);

        if window.count < limit {
            window.count += 1;
            Decision::Allowed { remaining: limit - window.count }
        } else {
            Decision::Denied {
                wait: wait_until(window.start.saturating_add(self.window_nanos), now),
                reason: "adaptive_limit",
            }
        }
    }
}

#[async_trait]
impl RateLimiter for AdaptiveLimiter {
    async fn acquire(&self, _ctx: &CallContext, identity: &str) -> Result<Decision, StoreError> {
        let decision = self.decide(identity, self.clock.now_nanos());
        self.counters.record(&decision);
        Ok(decision)
    }

    async fn remaining(&self, identity: &str) -> i64 {
        let now = self.clock.now_nanos();
        let limit = self.current_limit();
        match self.windows.get(identity) {
            Some(w) if now.saturating_sub(w.start) < self.window_nanos => {
                quota(limit.saturating_sub(w.count))
            }
            _ => quota(limit),
        }
    }

    async fn reset(&self, identity: &str) {
        self.windows.remove(identity);
    }

    fn stats(&self) -> LimiterStats {
        let now = self.clock.now_nanos();
        let limit = self.current_limit();
        let blocked = self
            .windows
            .iter()
            .filter(|w| now.saturating_sub(w.start) < self.window_nanos && w.count >= limit)
            .count();
        LimiterStats {
            algorithm: LimiterKind::Adaptive,
            tracked_identities: self.windows.len(),
            blocked_identities: blocked,
            admitted: self.counters.admitted(),
            rejected: self.counters.rejected(),
            limit,
        }
    }

    fn record_outcome(&self, success: bool) {
        if let Some(signal) = &self.signal {
            signal.record(success);
        }
    }
}

impl IdleEviction for AdaptiveLimiter {
    fn evict_idle(&self) -> usize {
        let now = self.clock.now_nanos();
        let max_idle = self.window_nanos.saturating_mul(2);
        let before = self.windows.len();
        self.windows.retain(|_, w| now.saturating_sub(w.last_access) <= max_idle);
        before.saturating_sub(self.windows.len())
    }

    fn eviction_interval(&self) -> Duration {
        Duration::from_nanos(self.window_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Debug)]
    struct FixedLoad(f64);

    impl LoadSignal for FixedLoad {
        fn load(&self) -> Option<f64> {
            Some(self.0)
        }
    }

    fn config(initial: u64, min: u64, max: u64) -> AdaptiveConfig {
        AdaptiveConfig {
            initial_limit: initial,
            min_limit: min,
            max_limit: max,
            window_ms: 1_000,
            adjust_interval_ms: 1_000,
            ..AdaptiveConfig::default()
        }
    }

    fn limiter(config: &AdaptiveConfig) -> (AdaptiveLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = AdaptiveLimiter::new(config).unwrap().with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    async fn tick(limiter: &AdaptiveLimiter, clock: &ManualClock) {
        clock.advance(Duration::from_secs(1));
        limiter.acquire(&CallContext::background(), "ticker").await.unwrap();
    }

    #[test]
    fn rejects_invalid_bounds() {
        let err = AdaptiveLimiter::new(&config(5, 10, 20)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAdaptiveBounds { .. }));
        assert!(AdaptiveLimiter::new(&config(5, 0, 20)).is_err());
    }

    #[test]
    fn steps_move_at_least_one_and_stay_in_bounds() {
        let bounds = Bounds { min: 2, max: 12, scale_up: 1.1, scale_down: 0.9 };
        assert_eq!(bounds.next(5, 0.9), 4);
        assert_eq!(bounds.next(5, 0.1), 6);
        assert_eq!(bounds.next(100, 0.1), 12);
        assert_eq!(bounds.next(2, 1.0), 2);
        assert_eq!(bounds.next(5, 0.6), 5);
    }

    #[tokio::test]
    async fn high_load_shrinks_to_min_and_never_below() {
        let (limiter, clock) = limiter(&config(20, 5, 50));
        let limiter = limiter.with_signal(Arc::new(FixedLoad(0.95)));
        for _ in 0..40 {
            tick(&limiter, &clock).await;
            assert!(limiter.current_limit() >= 5);
        }
        assert_eq!(limiter.current_limit(), 5);
    }

    #[tokio::test]
    async fn low_load_grows_to_max_and_never_above() {
        let (limiter, clock) = limiter(&config(20, 5, 50));
        let limiter = limiter.with_signal(Arc::new(FixedLoad(0.1)));
        for _ in 0..40 {
            tick(&limiter, &clock).await;
            assert!(limiter.current_limit() <= 50);
        }
        assert_eq!(limiter.current_limit(), 50);
    }

    #[tokio::test]
    async fn adjusts_at_most_once_per_interval() {
        let (limiter, clock) = limiter(&config(20, 5, 50));
        let limiter = limiter.with_signal(Arc::new(FixedLoad(0.95)));
        clock.advance(Duration::from_secs(1));
        for _ in 0..10 {
            limiter.acquire(&CallContext::background(), "a").await.unwrap();
        }
        assert_eq!(limiter.current_limit(), 18);
    }

    #[tokio::test]
    async fn error_rate_drives_the_limit() {
        let (limiter, clock) = limiter(&config(10, 2, 20));
        for _ in 0..9 {
            limiter.record_outcome(false);
        }
        limiter.record_outcome(true);
        tick(&limiter, &clock).await;
        assert_eq!(limiter.current_limit(), 9);

        for _ in 0..10 {
            limiter.record_outcome(true);
        }
        tick(&limiter, &clock).await;
        assert_eq!(limiter.current_limit(), 10);
    }

    #[tokio::test]
    async fn falls_back_to_utilisation() {
        let (limiter, clock) = limiter(&config(4, 2, 8));
        let limiter = limiter.without_signal();
        let ctx = CallContext::background();
        for _ in 0..5 {
            limiter.acquire(&ctx, "busy").await.unwrap();
        }
        assert_eq!(limiter.stats().rejected, 1);

        tick(&limiter, &clock).await;
        assert_eq!(limiter.current_limit(), 3, "peak of 5 over a limit of 4 is high load");
    }

    #[tokio::test]
    async fn enforces_current_limit_per_identity() {
        let (limiter, _) = limiter(&config(2, 1, 4));
        let ctx = CallContext::background();
        assert!(limiter.acquire(&ctx, "a").await.unwrap().is_allowed());
        assert!(limiter.acquire(&ctx, "a").await.unwrap().is_allowed());
        match limiter.acquire(&ctx, "a").await.unwrap() {
            Decision::Denied { reason, wait } => {
                assert_eq!(reason, "adaptive_limit");
                assert_eq!(wait, Duration::from_secs(1));
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(limiter.acquire(&ctx, "b").await.unwrap().is_allowed());
        assert_eq!(limiter.remaining("a").await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn adjustments_never_escape_freshly_set_bounds() {
        let (limiter, clock) = limiter(&config(20, 5, 50));
        let limiter = Arc::new(limiter.with_signal(Arc::new(FixedLoad(0.1))));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let grower = {
            let (limiter, clock, stop) = (limiter.clone(), clock.clone(), stop.clone());
            tokio::spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    clock.advance(Duration::from_secs(1));
                    limiter.acquire(&CallContext::background(), "a").await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for round in 0..200u64 {
            let max = 5 + round % 20;
            limiter.set_bounds(1, max).unwrap();
            assert!(limiter.current_limit() <= max, "limit above max {max}");
            tokio::task::yield_now().await;
        }
        stop.store(true, Ordering::Relaxed);
        grower.await.unwrap();
    }

    #[test]
    fn set_bounds_rejects_unreportable_max() {
        let limiter = AdaptiveLimiter::new(&config(20, 5, 50)).unwrap();
        assert!(matches!(limiter.set_bounds(1, u64::MAX), Err(ConfigError::RateTooLarge { .. })));
        assert_eq!(limiter.bounds(), (5, 50));
    }

    #[tokio::test]
    async fn set_bounds_clamps_current_limit() {
        let (limiter, _) = limiter(&config(20, 5, 50));
        limiter.set_bounds(1, 10).unwrap();
        assert_eq!(limiter.current_limit(), 10);
        assert_eq!(limiter.bounds(), (1, 10));
        assert!(limiter.set_bounds(0, 10).is_err());
    }
}
