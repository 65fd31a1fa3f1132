use super::cleanup::IdleEviction;
use super::{quota, validate_quota, validate_rate, wait_until, Counters, Decision, LimiterKind, LimiterStats, RateLimiter};
use crate::clock::{Clock, MonotonicClock};
use crate::{CallContext, ConfigError, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: u64,
    last_access: u64,
}

/// A Token Bucket rate limiter.
///
/// Each identity owns a bucket holding up to `burst_size` tokens, refilled continuously at
/// `rate` tokens per `window`. A request takes one whole token; a rejected request leaves the
/// fractional balance untouched. A new identity starts with a full bucket.
#[derive(Debug)]
pub struct TokenBucket {
    buckets: DashMap<String, Bucket>,
    rate: u64,
    capacity: f64,
    window_nanos: u64,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl TokenBucket {
    /// `burst_size` of 0 means "same as `rate`".
    pub fn new(rate: u64, window: Duration, burst_size: u64) -> Result<Self, ConfigError> {
        let window_nanos = validate_rate(rate, window)?;
        let capacity = if burst_size == 0 { rate } else { burst_size };
        validate_quota(capacity)?;
        Ok(Self {
            buckets: DashMap::new(),
            rate,
            capacity: capacity as f64,
            window_nanos,
            clock: Arc::new(MonotonicClock::default()),
            counters: Counters::default(),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    /// Balance after refilling up to `now`. Time running backwards adds nothing.
    fn refilled(&self, bucket: &Bucket, now: u64) -> f64 {
        let elapsed = now.saturating_sub(bucket.last_refill) as f64;
        let added = elapsed * self.rate as f64 / self.window_nanos as f64;
        (bucket.tokens + added).min(self.capacity)
    }

    fn decide(&self, identity: &str, now: u64) -> Decision {
        let full = Bucket { tokens: self.capacity, last_refill: now, last_access: now };
        let mut bucket = self.buckets.entry(identity.to_string()).or_insert(full);

        bucket.tokens = self.refilled(&bucket, now);
        // Never move the refill mark backwards, or the rewound span would be credited twice.
        bucket.last_refill = bucket.last_refill.max(now);
        bucket.last_access = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Decision::Allowed { remaining: bucket.tokens as u64 }
        } else {
            let missing = 1.0 - bucket.tokens;
            let wait_nanos = (missing * self.window_nanos as f64 / self.rate as f64).ceil() as u64;
            Decision::Denied {
                wait: wait_until(now.saturating_add(wait_nanos), now),
                reason: "token_bucket_empty",
            }
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn acquire(&self, _ctx: &CallContext, identity: &str) -> Result<Decision, StoreError> {
        let decision = self.decide(identity, self.clock.now_nanos());
        self.counters.record(&decision);
        Ok(decision)
    }

    async fn remaining(&self, identity: &str) -> i64 {
        let now = self.clock.now_nanos();
        match self.buckets.get(identity) {
            Some(bucket) => quota(self.refilled(&bucket, now) as u64),
            None => quota(self.capacity as u64),
        }
    }

    async fn reset(&self, identity: &str) {
        self.buckets.remove(identity);
    }

    fn stats(&self) -> LimiterStats {
        let now = self.clock.now_nanos();
        let blocked = self.buckets.iter().filter(|b| self.refilled(b.value(), now) < 1.0).count();
        LimiterStats {
            algorithm: LimiterKind::TokenBucket,
            tracked_identities: self.buckets.len(),
            blocked_identities: blocked,
            admitted: self.counters.admitted(),
            rejected: self.counters.rejected(),
            limit: self.rate,
        }
    }
}

impl IdleEviction for TokenBucket {
    fn evict_idle(&self) -> usize {
        let now = self.clock.now_nanos();
        let max_idle = self.window_nanos.saturating_mul(2);
        let before = self.buckets.len();
        self.buckets.retain(|_, b| now.saturating_sub(b.last_access) <= max_idle);
        before.saturating_sub(self.buckets.len())
    }

    fn eviction_interval(&self) -> Duration {
        Duration::from_nanos(self.window_nanos)
    }
}
