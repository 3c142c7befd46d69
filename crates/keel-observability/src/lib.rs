//! Keel Observability
//!
//! The core never formats or ships telemetry itself. It emits [`KeelEvent`]
//! values into an [`EventSink`]; sinks decide where they go. This crate also
//! owns the process-wide `tracing` subscriber setup used by the binary.

pub mod events;
pub mod sink;
pub mod trace;

pub use events::KeelEvent;
pub use sink::{ChannelSink, EventSink, FanoutSink, NoopSink, SharedSink, TracingSink};
pub use trace::{LoggingConfig, init_tracing};

/// Observability setup errors
#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
}
