//! Lifecycle events emitted by the primitives and the composite pipeline.
//!
//! Events are emitted, never stored, by the core. They flow into an [`EventSink`], which is a
//! `tower::Service<ResilienceEvent>` so sinks compose with ordinary tower combinators. The
//! audit and metrics subsystems that consume them live outside this crate.
//!
//! # Event kinds
//!
//! - **StateChange** / **Trip**: circuit breaker transitions
//! - **Admitted** / **Rejection**: admission decisions per pipeline stage
//! - **Retry** / **RetryExhausted**: retry loop progress
//! - **Completed**: final outcome of a composite call
//!
//! ```rust
//! use floodgate::telemetry::{EventKind, ResilienceEvent, Stage};
//!
//! let event = ResilienceEvent::new("payments", EventKind::Admitted { stage: Stage::Bulkhead });
//! assert!(event.to_string().contains("payments"));
//! ```

pub mod events;
pub mod sinks;

pub use events::{event_to_json, EventKind, ResilienceEvent, Stage};
pub use sinks::{
    emit_best_effort, ChannelSink, ComposedSinkError, EventSink, LogSink, MemorySink,
    MulticastSink, NullSink,
};
