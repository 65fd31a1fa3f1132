use crate::circuit_breaker::CircuitState;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Pipeline stage an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Bulkhead,
    RateLimiter,
    Retry,
    CircuitBreaker,
    Operation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Bulkhead => "bulkhead",
            Stage::RateLimiter => "rate_limiter",
            Stage::Retry => "retry",
            Stage::CircuitBreaker => "circuit_breaker",
            Stage::Operation => "operation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Circuit breaker moved between states.
    StateChange { from: CircuitState, to: CircuitState },
    /// Circuit breaker opened because of failures (from Closed or from a failed trial).
    Trip { failures: usize },
    /// A stage refused the call.
    Rejection { stage: Stage, reason: String },
    /// A stage let the call through.
    Admitted { stage: Stage },
    /// A failed attempt will be retried after `delay`.
    Retry { attempt: usize, delay: Duration },
    /// The retry budget ran out.
    RetryExhausted { attempts: usize },
    /// The composite call finished.
    Completed { success: bool, duration: Duration },
}

/// Observability record: kind, resource name, timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceEvent {
    pub resource: Arc<str>,
    pub timestamp: SystemTime,
    pub kind: EventKind,
}

impl ResilienceEvent {
    pub fn new(resource: impl Into<Arc<str>>, kind: EventKind) -> Self {
        Self { resource: resource.into(), timestamp: SystemTime::now(), kind }
    }

    /// Short machine-friendly name of the event kind.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::StateChange { .. } => "state_change",
            EventKind::Trip { .. } => "trip",
            EventKind::Rejection { .. } => "rejection",
            EventKind::Admitted { .. } => "admitted",
            EventKind::Retry { .. } => "retry",
            EventKind::RetryExhausted { .. } => "retry_exhausted",
            EventKind::Completed { .. } => "completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::StateChange { from, to } => write!(f, "StateChange({} -> {})", from, to),
            EventKind::Trip { failures } => write!(f, "Trip(failures={})", failures),
            EventKind::Rejection { stage, reason } => {
                write!(f, "Rejection({}, reason={})", stage, reason)
            }
            EventKind::Admitted { stage } => write!(f, "Admitted({})", stage),
            EventKind::Retry { attempt, delay } => {
                write!(f, "Retry(#{}, delay={:?})", attempt, delay)
            }
            EventKind::RetryExhausted { attempts } => {
                write!(f, "RetryExhausted(attempts={})", attempts)
            }
            EventKind::Completed { success, duration } => {
                let outcome = if *success { "success" } else { "failure" };
                write!(f, "Completed({}, duration={:?})", outcome, duration)
            }
        }
    }
}

impl fmt::Display for ResilienceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.resource, self.kind)
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert an event into a JSON value for sinks that ship events elsewhere.
pub fn event_to_json(event: &ResilienceEvent) -> serde_json::Value {
    let timestamp_ms =
        clamp_u64(event.timestamp.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis());
    let mut value = match &event.kind {
        EventKind::StateChange { from, to } => json!({
            "from": from.as_str(),
            "to": to.as_str(),
        }),
        EventKind::Trip { failures } => json!({ "failures": *failures }),
        EventKind::Rejection { stage, reason } => json!({
            "stage": stage.as_str(),
            "reason": reason,
        }),
        EventKind::Admitted { stage } => json!({ "stage": stage.as_str() }),
        EventKind::Retry { attempt, delay } => json!({
            "attempt": *attempt,
            "delay_ms": clamp_u64(delay.as_millis()),
        }),
        EventKind::RetryExhausted { attempts } => json!({ "attempts": *attempts }),
        EventKind::Completed { success, duration } => json!({
            "success": *success,
            "duration_ms": clamp_u64(duration.as_millis()),
        }),
    };
    if let Some(map) = value.as_object_mut() {
        map.insert("kind".into(), json!(event.kind_name()));
        map.insert("resource".into(), json!(&*event.resource));
        map.insert("timestamp_ms".into(), json!(timestamp_ms));
    }
    value
}
