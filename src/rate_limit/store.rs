use crate::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Result of one atomic trim-count-add round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request was recorded.
    pub admitted: bool,
    /// Requests in the window after the operation (including this one when admitted).
    pub count: u64,
    /// Timestamp of the oldest request still in the window, if any.
    pub oldest: Option<u64>,
}

/// Shared counter store behind [`DistributedLimiter`](super::DistributedLimiter).
///
/// Timestamps are nanoseconds on a clock every participating process agrees on. Each method
/// must be a single atomic operation against the store: two processes racing on one key must
/// never both see room for the last slot.
#[async_trait]
pub trait WindowStore: Send + Sync + std::fmt::Debug {
    /// Drop entries at or before `now - window`, count the rest, and record `now` only when the
    /// count is below `limit`.
    async fn trim_count_add(
        &self,
        key: &str,
        now: u64,
        window: u64,
        limit: u64,
    ) -> Result<WindowOutcome, StoreError>;

    /// Entries in the window ending at `now`, without recording anything.
    async fn count(&self, key: &str, now: u64, window: u64) -> Result<u64, StoreError>;

    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Lua script a Redis-backed [`WindowStore`] runs with `EVALSHA` for `trim_count_add`.
///
/// `KEYS[1]` is the identity key; `ARGV` is `now`, `window`, `limit` (nanoseconds, except
/// `limit`) and a member id unique per request. Returns `{admitted, count, oldest}` where
/// `oldest` is `-1` for an empty window. Redis runs scripts atomically, which is what makes the
/// three steps one operation.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, math.ceil(window / 1000000))
  count = count + 1
  admitted = 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {admitted, count, oldest_score}
"#;

/// Process-local [`WindowStore`]. Clones share the same data, so several limiter instances
/// handed clones behave like processes sharing one Redis.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWindowStore {
    windows: Arc<DashMap<String, VecDeque<u64>>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently holding entries.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

fn trim(entries: &mut VecDeque<u64>, now: u64, window: u64) {
    while entries.front().is_some_and(|&t| t.saturating_add(window) <= now) {
        entries.pop_front();
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn trim_count_add(
        &self,
        key: &str,
        now: u64,
        window: u64,
        limit: u64,
    ) -> Result<WindowOutcome, StoreError> {
        // The entry guard holds the shard lock for the whole sequence.
        let mut entries = self.windows.entry(key.to_string()).or_default();
        trim(&mut entries, now, window);
        let mut count = entries.len() as u64;
        let admitted = count < limit;
        if admitted {
            let stamp = entries.back().map_or(now, |&last| last.max(now));
            entries.push_back(stamp);
            count += 1;
        }
        Ok(WindowOutcome { admitted, count, oldest: entries.front().copied() })
    }

    async fn count(&self, key: &str, now: u64, window: u64) -> Result<u64, StoreError> {
        Ok(self.windows.get(key).map_or(0, |entries| {
            entries.iter().filter(|&&t| t.saturating_add(window) > now).count() as u64
        }))
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.windows.remove(key);
        Ok(())
    }
}
