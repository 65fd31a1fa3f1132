//! Error types for admission control and resilience primitives.
use crate::context::CancelReason;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type for all primitives.
///
/// Admission rejections (`RateLimited`, `CircuitOpen`, `BulkheadFull`) are returned as soon
/// as they are decided and are never retried by [`RetryExecutor`](crate::RetryExecutor).
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The rate limiter denied the identity.
    RateLimited { identity: String, wait: Duration, remaining: u64 },
    /// The circuit breaker for `resource` is open and has been for `open_for`.
    CircuitOpen { resource: String, open_for: Duration },
    /// The bulkhead for `resource` already runs `max_concurrent` calls.
    BulkheadFull { resource: String, max_concurrent: usize },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Arc<Vec<E>> },
    /// The caller's context was cancelled or its deadline passed.
    Cancelled(CancelReason),
    /// The shared counter store backing a distributed limiter failed.
    Store(StoreError),
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { identity, wait, remaining } => write!(
                f,
                "rate limit exceeded for '{}' ({} remaining, retry in {:?})",
                identity, remaining, wait
            ),
            Self::CircuitOpen { resource, open_for } => {
                write!(f, "circuit breaker '{}' open (open for {:?})", resource, open_for)
            }
            Self::BulkheadFull { resource, max_concurrent } => {
                write!(f, "bulkhead '{}' full (max {} concurrent)", resource, max_concurrent)
            }
            Self::RetryExhausted { attempts, failures } => {
                let recorded = failures.len();
                let truncated_note = if recorded < *attempts {
                    format!(" (recorded last {} failures)", recorded)
                } else {
                    String::new()
                };
                if let Some(last) = failures.last() {
                    write!(
                        f,
                        "retry exhausted after {} attempts{}; last error: {}",
                        attempts, truncated_note, last
                    )
                } else {
                    write!(
                        f,
                        "retry exhausted after {} attempts{}; no recorded failures",
                        attempts, truncated_note
                    )
                }
            }
            Self::Cancelled(reason) => write!(f, "{}", reason),
            Self::Store(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            Self::Store(e) => Some(e),
            Self::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Construct a `RetryExhausted` variant while enforcing the `MAX_RETRY_FAILURES` cap by keeping the most recent failures.
    pub fn retry_exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        ResilienceError::RetryExhausted { attempts, failures: Arc::new(trimmed) }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// True for the fast-fail kinds a caller maps to a "too busy" response.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::CircuitOpen { .. } | Self::BulkheadFull { .. }
        )
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access all recorded failures for RetryExhausted, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// The final failure behind a `RetryExhausted`.
    pub fn last_error(&self) -> Option<&E> {
        self.failures().and_then(|f| f.last())
    }

    /// Attempts made before giving up, for `RetryExhausted`.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Resource named by a breaker or bulkhead rejection.
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { resource, .. } | Self::BulkheadFull { resource, .. } => {
                Some(resource.as_str())
            }
            _ => None,
        }
    }

    /// Suggested wait before retrying, for rate-limit rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait, .. } => Some(*wait),
            _ => None,
        }
    }
}

impl<E> From<CancelReason> for ResilienceError<E> {
    fn from(reason: CancelReason) -> Self {
        ResilienceError::Cancelled(reason)
    }
}

impl<E> From<StoreError> for ResilienceError<E> {
    fn from(err: StoreError) -> Self {
        ResilienceError::Store(err)
    }
}

impl<E> From<LimitError> for ResilienceError<E> {
    fn from(err: LimitError) -> Self {
        match err {
            LimitError::Exceeded { identity, wait, remaining } => {
                ResilienceError::RateLimited { identity, wait, remaining }
            }
            LimitError::Store(e) => ResilienceError::Store(e),
            LimitError::Cancelled(reason) => ResilienceError::Cancelled(reason),
        }
    }
}

/// Failure reported by an atomic counter store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with something the limiter cannot interpret.
    #[error("counter store returned an invalid reply: {0}")]
    InvalidReply(String),
}

/// Outcome of [`RateLimiter::allow`](crate::rate_limit::RateLimiter::allow) when the caller is
/// not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("rate limit exceeded for '{identity}' (retry in {wait:?})")]
    Exceeded { identity: String, wait: Duration, remaining: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cancelled(#[from] CancelReason),
}

impl LimitError {
    pub fn is_exceeded(&self) -> bool {
        matches!(self, LimitError::Exceeded { .. })
    }
}

/// Invalid construction parameters. Always reported when building a primitive, never at call
/// time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("rate must be > 0")]
    ZeroRate,
    #[error("window must be > 0")]
    ZeroWindow,
    #[error("quota {provided} exceeds the maximum of {max}")]
    RateTooLarge { provided: u64, max: u64 },
    #[error("{what} capacity must be > 0")]
    ZeroCapacity { what: &'static str },
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("reset_timeout must be > 0 (got {0:?})")]
    InvalidResetTimeout(Duration),
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("multiplier must be finite and >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("max_interval ({max:?}) must be >= initial_interval ({initial:?})")]
    InvalidInterval { initial: Duration, max: Duration },
    #[error("adaptive bounds invalid: min {min}, max {max}, initial {initial}")]
    InvalidAdaptiveBounds { min: u64, max: u64, initial: u64 },
    #[error("{name} must be finite and positive (got {value})")]
    InvalidFactor { name: &'static str, value: f64 },
    #[error("distributed limiter requires a counter store")]
    MissingStore,
    #[error("adaptive limiter requires adaptive settings")]
    MissingAdaptiveSettings,
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);
    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for DummyError {}

    #[test]
    fn circuit_open_display_names_resource() {
        let err: ResilienceError<DummyError> = ResilienceError::CircuitOpen {
            resource: "payments".into(),
            open_for: Duration::from_secs(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("payments"));
        assert!(msg.contains("open"));
        assert_eq!(err.resource(), Some("payments"));
    }

    #[test]
    fn bulkhead_display_includes_capacity() {
        let err: ResilienceError<DummyError> =
            ResilienceError::BulkheadFull { resource: "db".into(), max_concurrent: 50 };
        let msg = err.to_string();
        assert!(msg.contains("db"));
        assert!(msg.contains("50"));
    }

    #[test]
    fn retry_exhausted_display_includes_last_error() {
        let err = ResilienceError::retry_exhausted(3, vec![DummyError("first"), DummyError("last")]);
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("last error: last"));
        assert_eq!(err.last_error(), Some(&DummyError("last")));
        assert_eq!(err.attempts(), Some(3));
    }

    #[test]
    fn retry_exhausted_display_handles_empty_failures() {
        let err: ResilienceError<DummyError> = ResilienceError::retry_exhausted(3, vec![]);
        let msg = format!("{}", err);
        assert!(msg.contains("no recorded failures"));
        assert!(err.last_error().is_none());
    }

    #[test]
    fn retry_exhausted_caps_history() {
        let failures: Vec<_> = (0..25).map(|_| DummyError("x")).collect();
        let err = ResilienceError::retry_exhausted(25, failures);
        assert_eq!(err.failures().unwrap().len(), MAX_RETRY_FAILURES);
        assert!(err.to_string().contains("recorded last 10 failures"));
    }

    #[test]
    fn admission_rejections_are_classified() {
        let limited: ResilienceError<DummyError> = ResilienceError::RateLimited {
            identity: "u1".into(),
            wait: Duration::from_millis(100),
            remaining: 0,
        };
        assert!(limited.is_rate_limited());
        assert!(limited.is_admission_rejection());
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(100)));

        let inner = ResilienceError::Inner(DummyError("boom"));
        assert!(!inner.is_admission_rejection());
        assert!(inner.is_inner());

        let cancelled: ResilienceError<DummyError> = CancelReason::DeadlineExceeded.into();
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_admission_rejection());
    }

    #[test]
    fn limit_error_converts_into_resilience_error() {
        let err: ResilienceError<DummyError> = LimitError::Exceeded {
            identity: "10.0.0.1".into(),
            wait: Duration::from_secs(1),
            remaining: 0,
        }
        .into();
        assert!(err.is_rate_limited());

        let err: ResilienceError<DummyError> =
            LimitError::Store(StoreError::Unavailable("refused".into())).into();
        assert!(matches!(err, ResilienceError::Store(StoreError::Unavailable(_))));
    }

    #[test]
    fn source_points_at_inner_and_last_failure() {
        let inner = ResilienceError::Inner(DummyError("x"));
        assert_eq!(inner.source().unwrap().to_string(), "x");

        let exhausted = ResilienceError::retry_exhausted(2, vec![DummyError("a"), DummyError("b")]);
        assert_eq!(exhausted.source().unwrap().to_string(), "b");

        let open: ResilienceError<DummyError> =
            ResilienceError::CircuitOpen { resource: "r".into(), open_for: Duration::ZERO };
        assert!(open.source().is_none());
    }

    #[test]
    fn config_error_messages_are_descriptive() {
        assert_eq!(ConfigError::ZeroRate.to_string(), "rate must be > 0");
        let err = ConfigError::InvalidInterval {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("max_interval"));
    }
}
