//! Event sinks.
//!
//! `emit` is synchronous and must not block: it is called from inside the
//! supervisor's monitor tasks and the engine's dispatch loop.

use crate::events::KeelEvent;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receiver of structured events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &KeelEvent);
}

/// Shared sink handle passed into the core components.
pub type SharedSink = Arc<dyn EventSink>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &KeelEvent) {}
}

/// Writes each event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &KeelEvent) {
        match event {
            KeelEvent::HandleStateChanged {
                handle,
                from,
                to,
                reason,
                ..
            } => {
                let reason = reason.as_deref().unwrap_or("");
                if *to == keel_core::HandleState::Degraded {
                    tracing::warn!(handle = %handle, %from, %to, reason, "Handle degraded");
                } else {
                    tracing::info!(handle = %handle, %from, %to, reason, "Handle state changed");
                }
            }
            KeelEvent::RestartScheduled {
                handle,
                attempt,
                backoff_ms,
            } => {
                tracing::warn!(handle = %handle, attempt, backoff_ms, "Restart scheduled");
            }
            KeelEvent::CapabilityExhausted {
                handle,
                consecutive_failures,
            } => {
                tracing::error!(
                    handle = %handle,
                    consecutive_failures,
                    "Capability exhausted its restart budget"
                );
            }
            KeelEvent::ProtocolError {
                handle,
                message,
                fatal,
            } => {
                tracing::warn!(handle = %handle, fatal, error = %message, "Protocol error");
            }
            KeelEvent::RequestPhaseChanged { request, phase } => {
                tracing::debug!(request = %request, %phase, "Request phase");
            }
            KeelEvent::RetryScheduled {
                request,
                tool,
                attempt,
                backoff_ms,
                reason,
            } => {
                tracing::warn!(
                    request = %request,
                    tool = %tool,
                    attempt,
                    backoff_ms,
                    reason = %reason,
                    "Retrying tool call"
                );
            }
            KeelEvent::CallCompleted {
                request,
                tool,
                status,
                attempts,
                elapsed_ms,
            } => {
                tracing::info!(
                    request = %request,
                    tool = %tool,
                    status = ?status,
                    attempts,
                    elapsed_ms,
                    "Tool call finished"
                );
            }
        }
    }
}

/// Publishes events on a broadcast channel for an external collector.
///
/// Slow subscribers lag and lose the oldest events; emitting never blocks.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: broadcast::Sender<KeelEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeelEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &KeelEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &KeelEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
