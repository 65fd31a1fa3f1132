#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # floodgate
//!
//! Admission control and fault isolation for async Rust services: rate limiting, circuit
//! breaking, bulkheads and retries, composable into one pipeline around a protected call.
//!
//! ## Features
//!
//! - **Rate limiters**: token bucket, sliding window, fixed window with burst, adaptive, and a
//!   distributed sliding window backed by a shared [`WindowStore`](rate_limit::WindowStore)
//! - **Circuit breakers** with single-trial half-open recovery and state observers
//! - **Bulkheads** that reject instead of queueing
//! - **Retries** with exponential backoff, jitter and a retry predicate
//! - **Composite pipeline** ordering the stages and reporting [`telemetry`] events
//! - **HTTP middleware** as a `tower` layer
//! - Every blocking point honours a [`CallContext`] deadline or cancellation
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{Bulkhead, CallContext, CircuitBreaker, CompositeExecutor, ResilienceError};
//! use floodgate::rate_limit::TokenBucket;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let executor = CompositeExecutor::<std::io::Error>::builder()
//!     .resource("inventory")
//!     .bulkhead(Bulkhead::new("inventory", 16).unwrap())
//!     .rate_limiter(Arc::new(TokenBucket::new(100, Duration::from_secs(1), 20).unwrap()))
//!     .circuit_breaker(CircuitBreaker::new("inventory", 5, Duration::from_secs(30)).unwrap())
//!     .build();
//!
//! let ctx = CallContext::with_timeout(Duration::from_secs(2));
//! let stock = executor
//!     .execute_for(&ctx, "client-42", || async { Ok::<_, ResilienceError<std::io::Error>>(7) })
//!     .await
//!     .unwrap();
//! assert_eq!(stock, 7);
//! # });
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod composite;
pub mod config;
pub mod context;
pub mod dynamic;
pub mod error;
pub mod jitter;
pub mod prelude;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use backoff::{Backoff, MAX_BACKOFF};
pub use bulkhead::{Bulkhead, BulkheadStats};
pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitState, ObserverId, StateObserver};
pub use clock::{Clock, ManualClock, MonotonicClock, WallClock};
pub use composite::{CompositeExecutor, CompositeExecutorBuilder, CompositeStats};
pub use config::CompositeConfig;
pub use context::{CallContext, CancelReason};
pub use dynamic::DynamicConfig;
pub use error::{ConfigError, LimitError, ResilienceError, StoreError};
pub use jitter::Jitter;
pub use rate_limit::{Decision, LimiterKind, LimiterStats, RateLimiter};
pub use registry::{BreakerRegistry, RegistryError};
pub use retry::{RetryExecutor, RetryExecutorBuilder, RetryNotice, RetryStats};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
