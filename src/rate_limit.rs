//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimiter`]: the contract every algorithm satisfies.
//! - [`Decision`]: the result of a rate limit check (Allowed/Denied).
//! - One implementation per algorithm: [`TokenBucket`], [`SlidingWindow`], [`FixedWindow`],
//!   [`AdaptiveLimiter`] and [`DistributedLimiter`].
//! - [`RateLimitLayer`]: tower middleware that enforces a limiter per HTTP request.
//!
//! # Architecture
//!
//! - **Logic**: each algorithm owns its per-identity state in a sharded map, so unrelated
//!   identities never contend on one lock and two limiters never share state.
//! - **Storage**: the distributed limiter delegates to a [`WindowStore`], whose single atomic
//!   operation lets several processes enforce one limit.
//! - **Housekeeping**: [`CleanupTask`] evicts idle identities in the background and stops when
//!   its limiter is dropped or the task is shut down.
//!
//! ```rust
//! use floodgate::rate_limit::{RateLimiter, TokenBucket};
//! use floodgate::CallContext;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let limiter = TokenBucket::new(10, Duration::from_secs(1), 2).unwrap();
//! let ctx = CallContext::background();
//! assert!(limiter.allow(&ctx, "10.0.0.1").await.is_ok());
//! assert!(limiter.allow(&ctx, "10.0.0.1").await.is_ok());
//! assert!(limiter.allow(&ctx, "10.0.0.1").await.unwrap_err().is_exceeded());
//! # });
//! ```

use crate::clock::duration_nanos;
use crate::config::LimiterConfig;
use crate::{CallContext, ConfigError, LimitError, StoreError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod adaptive;
pub mod cleanup;
pub mod distributed;
pub mod fixed_window;
pub mod middleware;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;

pub use adaptive::{AdaptiveLimiter, ErrorRateSignal, LoadSignal};
pub use cleanup::{CleanupTask, IdleEviction};
pub use distributed::DistributedLimiter;
pub use fixed_window::FixedWindow;
pub use middleware::{KeyExtractor, RateLimitLayer, RateLimitService};
pub use sliding_window::SlidingWindow;
pub use store::{InMemoryWindowStore, WindowOutcome, WindowStore, SLIDING_WINDOW_SCRIPT};
pub use token_bucket::TokenBucket;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Number of permits remaining after this acquisition.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u64,
    },
    /// The request is denied.
    Denied {
        /// How long the caller should wait before a retry can succeed.
        /// Useful for `Retry-After` headers.
        wait: Duration,
        /// Reason for denial (e.g., "token_bucket_empty", "window_full").
        reason: &'static str,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Algorithm selector used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    Adaptive,
    Distributed,
}

impl LimiterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::TokenBucket => "token_bucket",
            LimiterKind::SlidingWindow => "sliding_window",
            LimiterKind::FixedWindow => "fixed_window",
            LimiterKind::Adaptive => "adaptive",
            LimiterKind::Distributed => "distributed",
        }
    }
}

/// Point-in-time counters for one limiter.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LimiterStats {
    pub algorithm: LimiterKind,
    /// Identities with live state in this process.
    pub tracked_identities: usize,
    /// Tracked identities that would be rejected right now.
    pub blocked_identities: usize,
    pub admitted: u64,
    pub rejected: u64,
    /// Current per-window limit (moves for the adaptive limiter).
    pub limit: u64,
}

/// Core interface for rate limiting logic.
///
/// Implementations decide per identity (an IP address, a client id, a user). `acquire` is the
/// raw decision; `allow` is the fast-fail form used by the composite pipeline and middleware.
/// Every limiter can be swept by a [`CleanupTask`], including one behind `Arc<dyn RateLimiter>`.
#[async_trait]
pub trait RateLimiter: IdleEviction + Send + Sync + std::fmt::Debug {
    /// Decide whether `identity` may make one more request, consuming quota if so.
    async fn acquire(&self, ctx: &CallContext, identity: &str) -> Result<Decision, StoreError>;

    /// `Ok(remaining)` when admitted, `Err(LimitError::Exceeded)` when not.
    async fn allow(&self, ctx: &CallContext, identity: &str) -> Result<u64, LimitError> {
        ctx.check()?;
        match ctx.run(self.acquire(ctx, identity)).await?? {
            Decision::Allowed { remaining } => Ok(remaining),
            Decision::Denied { wait, reason } => {
                tracing::debug!(identity, ?wait, reason, "rate limit exceeded");
                Err(LimitError::Exceeded { identity: identity.to_string(), wait, remaining: 0 })
            }
        }
    }

    /// Quota left for `identity` without consuming any. Unknown identities report full quota.
    async fn remaining(&self, identity: &str) -> i64;

    /// Forget everything about `identity`; its next request starts with full quota.
    async fn reset(&self, identity: &str);

    fn stats(&self) -> LimiterStats;

    /// Feed back the outcome of an admitted call. Only load-aware limiters use it.
    fn record_outcome(&self, _success: bool) {}
}

/// Build the limiter selected by `config`. `store` is required for the distributed kind.
pub fn build_limiter(
    config: &LimiterConfig,
    store: Option<Arc<dyn WindowStore>>,
) -> Result<Arc<dyn RateLimiter>, ConfigError> {
    config.validate()?;
    let window = config.window();
    let limiter: Arc<dyn RateLimiter> = match config.algorithm {
        LimiterKind::TokenBucket => {
            Arc::new(TokenBucket::new(config.rate, window, config.burst_size)?)
        }
        LimiterKind::SlidingWindow => Arc::new(SlidingWindow::new(config.rate, window)?),
        LimiterKind::FixedWindow => {
            Arc::new(FixedWindow::new(config.rate, window, config.burst_size)?)
        }
        LimiterKind::Adaptive => {
            let settings = config.adaptive.as_ref().ok_or(ConfigError::MissingAdaptiveSettings)?;
            Arc::new(AdaptiveLimiter::new(settings)?)
        }
        LimiterKind::Distributed => {
            let store = store.ok_or(ConfigError::MissingStore)?;
            let prefix = config
                .distributed
                .as_ref()
                .map(|d| d.key_prefix.clone())
                .unwrap_or_else(|| distributed::DEFAULT_KEY_PREFIX.to_string());
            Arc::new(DistributedLimiter::new(store, prefix, config.rate, window)?)
        }
    };
    tracing::debug!(algorithm = config.algorithm.as_str(), rate = config.rate, ?window, "rate limiter built");
    Ok(limiter)
}

/// Largest per-window quota a limiter accepts; quotas are reported as `i64`.
pub const MAX_RATE: u64 = i64::MAX as u64;

pub(crate) fn validate_rate(rate: u64, window: Duration) -> Result<u64, ConfigError> {
    if rate == 0 {
        return Err(ConfigError::ZeroRate);
    }
    validate_quota(rate)?;
    if window.is_zero() {
        return Err(ConfigError::ZeroWindow);
    }
    Ok(duration_nanos(window))
}

pub(crate) fn validate_quota(quota: u64) -> Result<(), ConfigError> {
    if quota > MAX_RATE {
        return Err(ConfigError::RateTooLarge { provided: quota, max: MAX_RATE });
    }
    Ok(())
}

/// `n` as a signed quota, saturating at `i64::MAX`.
pub(crate) fn quota(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Admission counters shared by every algorithm.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    pub(crate) fn record(&self, decision: &Decision) {
        match decision {
            Decision::Allowed { .. } => self.admitted.fetch_add(1, Ordering::Relaxed),
            Decision::Denied { .. } => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Nanoseconds until `deadline`, as a `Duration`, never negative.
pub(crate) fn wait_until(deadline: u64, now: u64) -> Duration {
    Duration::from_nanos(deadline.saturating_sub(now))
}
