use super::cleanup::IdleEviction;
use super::{quota, validate_rate, wait_until, Counters, Decision, LimiterKind, LimiterStats, RateLimiter};
use crate::clock::{Clock, MonotonicClock};
use crate::{CallContext, ConfigError, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Log {
    /// Admission timestamps, oldest first.
    admitted: VecDeque<u64>,
    last_access: u64,
}

impl Log {
    fn trim(&mut self, now: u64, window: u64) {
        while let Some(&oldest) = self.admitted.front() {
            if oldest.saturating_add(window) <= now {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Exact sliding-window limiter: at most `limit` admissions in any trailing `window`.
///
/// Keeps one timestamp per admitted request, so memory per identity is bounded by `limit`.
#[derive(Debug)]
pub struct SlidingWindow {
    logs: DashMap<String, Log>,
    limit: u64,
    window_nanos: u64,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl SlidingWindow {
    pub fn new(limit: u64, window: Duration) -> Result<Self, ConfigError> {
        let window_nanos = validate_rate(limit, window)?;
        Ok(Self {
            logs: DashMap::new(),
            limit,
            window_nanos,
            clock: Arc::new(MonotonicClock::default()),
            counters: Counters::default(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn decide(&self, identity: &str, now: u64) -> Decision {
        let mut log = self.logs.entry(identity.to_string()).or_default();
        log.trim(now, self.window_nanos);
        log.last_access = now;

        let count = log.admitted.len() as u64;
        if count < self.limit {
            // Keep the log ordered even if the clock stepped backwards.
            let stamp = log.admitted.back().map_or(now, |&last| last.max(now));
            log.admitted.push_back(stamp);
            Decision::Allowed { remaining: self.limit - count - 1 }
        } else {
            let oldest = log.admitted.front().copied().unwrap_or(now);
            Decision::Denied {
                wait: wait_until(oldest.saturating_add(self.window_nanos), now),
                reason: "window_full",
            }
        }
    }

    fn live_count(&self, log: &Log, now: u64) -> u64 {
        log.admitted
            .iter()
            .filter(|&&t| t.saturating_add(self.window_nanos) > now)
            .count() as u64
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    async fn acquire(&self, _ctx: &CallContext, identity: &str) -> Result<Decision, StoreError> {
        let decision = self.decide(identity, self.clock.now_nanos());
        self.counters.record(&decision);
        Ok(decision)
    }

    async fn remaining(&self, identity: &str) -> i64 {
        let now = self.clock.now_nanos();
        let used = self.logs.get(identity).map_or(0, |log| self.live_count(&log, now));
        quota(self.limit.saturating_sub(used))
    }

    async fn reset(&self, identity: &str) {
        self.logs.remove(identity);
    }

    fn stats(&self) -> LimiterStats {
        let now = self.clock.now_nanos();
        let blocked =
            self.logs.iter().filter(|log| self.live_count(log.value(), now) >= self.limit).count();
        LimiterStats {
            algorithm: LimiterKind::SlidingWindow,
            tracked_identities: self.logs.len(),
            blocked_identities: blocked,
            admitted: self.counters.admitted(),
            rejected: self.counters.rejected(),
            limit: self.limit,
        }
    }
}

impl IdleEviction for SlidingWindow {
    fn evict_idle(&self) -> usize {
        let now = self.clock.now_nanos();
        let max_idle = self.window_nanos.saturating_mul(2);
        let before = self.logs.len();
        self.logs.retain(|_, log| now.saturating_sub(log.last_access) <= max_idle);
        before.saturating_sub(self.logs.len())
    }

    fn eviction_interval(&self) -> Duration {
        Duration::from_nanos(self.window_nanos)
    }
}
