use super::cleanup::IdleEviction;
use super::store::WindowStore;
use super::{quota, validate_rate, wait_until, Counters, Decision, LimiterKind, LimiterStats, RateLimiter};
use crate::clock::{Clock, WallClock};
use crate::{CallContext, ConfigError, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Key prefix used when the configuration does not name one.
pub const DEFAULT_KEY_PREFIX: &str = "floodgate:ratelimit";

/// Sliding-window limiter whose state lives in a shared [`WindowStore`], so every process
/// pointed at the same store enforces one limit per identity.
///
/// Timestamps come from [`WallClock`] by default because readings from different processes
/// must be comparable.
#[derive(Debug)]
pub struct DistributedLimiter {
    store: Arc<dyn WindowStore>,
    prefix: String,
    limit: u64,
    window_nanos: u64,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl DistributedLimiter {
    pub fn new(
        store: Arc<dyn WindowStore>,
        prefix: impl Into<String>,
        limit: u64,
        window: Duration,
    ) -> Result<Self, ConfigError> {
        let window_nanos = validate_rate(limit, window)?;
        Ok(Self {
            store,
            prefix: prefix.into(),
            limit,
            window_nanos,
            clock: Arc::new(WallClock),
            counters: Counters::default(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Store key for `identity`.
    pub fn key(&self, identity: &str) -> String {
        format!("{}:{}", self.prefix, identity)
    }
}

#[async_trait]
impl RateLimiter for DistributedLimiter {
    async fn acquire(&self, _ctx: &CallContext, identity: &str) -> Result<Decision, StoreError> {
        let now = self.clock.now_nanos();
        let key = self.key(identity);
        let outcome = self
            .store
            .trim_count_add(&key, now, self.window_nanos, self.limit)
            .await
            .map_err(|e| {
                tracing::warn!(key = %key, error = %e, "counter store failed");
                e
            })?;

        let decision = if outcome.admitted {
            Decision::Allowed { remaining: self.limit.saturating_sub(outcome.count) }
        } else {
            let oldest = outcome.oldest.unwrap_or(now);
            Decision::Denied {
                wait: wait_until(oldest.saturating_add(self.window_nanos), now),
                reason: "window_full",
            }
        };
        self.counters.record(&decision);
        Ok(decision)
    }

    async fn remaining(&self, identity: &str) -> i64 {
        let now = self.clock.now_nanos();
        match self.store.count(&self.key(identity), now, self.window_nanos).await {
            Ok(used) => quota(self.limit.saturating_sub(used)),
            Err(e) => {
                tracing::warn!(identity, error = %e, "counter store failed; reporting no quota");
                0
            }
        }
    }

    async fn reset(&self, identity: &str) {
        if let Err(e) = self.store.clear(&self.key(identity)).await {
            tracing::warn!(identity, error = %e, "failed to clear rate limit state");
        }
    }

    /// Identity state lives in the store, so the tracked and blocked counts are always zero.
    fn stats(&self) -> LimiterStats {
        LimiterStats {
            algorithm: LimiterKind::Distributed,
            tracked_identities: 0,
            blocked_identities: 0,
            admitted: self.counters.admitted(),
            rejected: self.counters.rejected(),
            limit: self.limit,
        }
    }
}

/// The store expires idle keys itself, so there is nothing to sweep locally.
impl IdleEviction for DistributedLimiter {
    fn evict_idle(&self) -> usize {
        0
    }

    fn eviction_interval(&self) -> Duration {
        Duration::from_nanos(self.window_nanos)
    }
}
