use super::cleanup::IdleEviction;
use super::{quota, validate_quota, validate_rate, wait_until, Counters, Decision, LimiterKind, LimiterStats, RateLimiter};
use crate::clock::{Clock, MonotonicClock};
use crate::{CallContext, ConfigError, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Counter {
    window_start: u64,
    count: u64,
    burst_tokens: u64,
    last_access: u64,
}

/// Fixed-window counter with a per-window burst allowance.
///
/// Admits `rate` requests per window, then up to `burst_size` more from a burst pool that is
/// refilled when the window rolls over. Windows start at each identity's first request after
/// the previous window ended.
///
/// Cheaper than [`SlidingWindow`](super::SlidingWindow) (constant state per identity) but an
/// identity can get `2 × (rate + burst_size)` requests through in an interval that straddles a
/// window boundary. That trade-off is intended.
#[derive(Debug)]
pub struct FixedWindow {
    counters: DashMap<String, Counter>,
    rate: u64,
    burst_size: u64,
    window_nanos: u64,
    clock: Arc<dyn Clock>,
    stats: Counters,
}

impl FixedWindow {
    pub fn new(rate: u64, window: Duration, burst_size: u64) -> Result<Self, ConfigError> {
        let window_nanos = validate_rate(rate, window)?;
        validate_quota(rate.saturating_add(burst_size))?;
        Ok(Self {
            counters: DashMap::new(),
            rate,
            burst_size,
            window_nanos,
            clock: Arc::new(MonotonicClock::default()),
            stats: Counters::default(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn fresh(&self, now: u64) -> Counter {
        Counter { window_start: now, count: 0, burst_tokens: self.burst_size, last_access: now }
    }

    fn expired(&self, counter: &Counter, now: u64) -> bool {
        now.saturating_sub(counter.window_start) >= self.window_nanos
    }

    fn decide(&self, identity: &str, now: u64) -> Decision {
        let mut counter = self.counters.entry(identity.to_string()).or_insert_with(|| self.fresh(now));
        if self.expired(&counter, now) {
            *counter = self.fresh(now);
        }
        counter.last_access = now;

        if counter.count < self.rate {
            counter.count += 1;
        } else if counter.burst_tokens > 0 {
            counter.burst_tokens -= 1;
        } else {
            return Decision::Denied {
                wait: wait_until(counter.window_start.saturating_add(self.window_nanos), now),
                reason: "window_full",
            };
        }
        Decision::Allowed { remaining: self.left(&counter) }
    }

    fn left(&self, counter: &Counter) -> u64 {
        self.rate.saturating_sub(counter.count).saturating_add(counter.burst_tokens)
    }
}

#[async_trait]
impl RateLimiter for FixedWindow {
    async fn acquire(&self, _ctx: &CallContext, identity: &str) -> Result<Decision, StoreError> {
        let decision = self.decide(identity, self.clock.now_nanos());
        self.stats.record(&decision);
        Ok(decision)
    }

    async fn remaining(&self, identity: &str) -> i64 {
        let now = self.clock.now_nanos();
        match self.counters.get(identity) {
            Some(counter) if !self.expired(&counter, now) => quota(self.left(&counter)),
            _ => quota(self.rate.saturating_add(self.burst_size)),
        }
    }

    async fn reset(&self, identity: &str) {
        self.counters.remove(identity);
    }

    fn stats(&self) -> LimiterStats {
        let now = self.clock.now_nanos();
        let blocked = self
            .counters
            .iter()
            .filter(|c| !self.expired(c.value(), now) && self.left(c.value()) == 0)
            .count();
        LimiterStats {
            algorithm: LimiterKind::FixedWindow,
            tracked_identities: self.counters.len(),
            blocked_identities: blocked,
            admitted: self.stats.admitted(),
            rejected: self.stats.rejected(),
            limit: self.rate,
        }
    }
}

impl IdleEviction for FixedWindow {
    fn evict_idle(&self) -> usize {
        let now = self.clock.now_nanos();
        let max_idle = self.window_nanos.saturating_mul(2);
        let before = self.counters.len();
        self.counters.retain(|_, c| now.saturating_sub(c.last_access) <= max_idle);
        before.saturating_sub(self.counters.len())
    }

    fn eviction_interval(&self) -> Duration {
        Duration::from_nanos(self.window_nanos)
    }
}
