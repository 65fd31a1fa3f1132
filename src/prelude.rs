//! Convenient re-exports for common floodgate types.
pub use crate::{
    composite::{CompositeExecutor, CompositeStats},
    config::{
        AdaptiveConfig, BreakerConfig, BulkheadConfig, CompositeConfig, LimiterConfig, RetryConfig,
    },
    rate_limit::{
        build_limiter, AdaptiveLimiter, DistributedLimiter, FixedWindow, RateLimitLayer,
        RateLimiter, SlidingWindow, TokenBucket,
    },
    telemetry::{EventKind, EventSink, MemorySink, NullSink, ResilienceEvent, Stage},
    Backoff, Bulkhead, CallContext, CircuitBreaker, CircuitState, ConfigError, Jitter,
    LimitError, ResilienceError, RetryExecutor,
};
