//! Structured status events.

use chrono::{DateTime, Utc};
use keel_core::{CallStatus, HandleId, HandleState, RequestId, RequestPhase, ToolName};
use serde::Serialize;

/// Everything the orchestration core reports to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KeelEvent {
    HandleStateChanged {
        handle: HandleId,
        from: HandleState,
        to: HandleState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    RestartScheduled {
        handle: HandleId,
        attempt: u32,
        backoff_ms: u64,
    },
    /// Terminal: the handle will not be restarted automatically.
    CapabilityExhausted {
        handle: HandleId,
        consecutive_failures: u32,
    },
    ProtocolError {
        handle: HandleId,
        message: String,
        fatal: bool,
    },
    RequestPhaseChanged {
        request: RequestId,
        phase: RequestPhase,
    },
    RetryScheduled {
        request: RequestId,
        tool: ToolName,
        attempt: u32,
        backoff_ms: u64,
        reason: String,
    },
    CallCompleted {
        request: RequestId,
        tool: ToolName,
        status: CallStatus,
        attempts: u32,
        elapsed_ms: u64,
    },
}

impl KeelEvent {
    pub fn handle_transition(
        handle: &HandleId,
        from: HandleState,
        to: HandleState,
        reason: Option<String>,
    ) -> Self {
        KeelEvent::HandleStateChanged {
            handle: handle.clone(),
            from,
            to,
            reason,
            at: Utc::now(),
        }
    }

    /// Stable event name, also used as the `event` tag in JSON.
    pub fn name(&self) -> &'static str {
        match self {
            KeelEvent::HandleStateChanged { .. } => "handle_state_changed",
            KeelEvent::RestartScheduled { .. } => "restart_scheduled",
            KeelEvent::CapabilityExhausted { .. } => "capability_exhausted",
            KeelEvent::ProtocolError { .. } => "protocol_error",
            KeelEvent::RequestPhaseChanged { .. } => "request_phase_changed",
            KeelEvent::RetryScheduled { .. } => "retry_scheduled",
            KeelEvent::CallCompleted { .. } => "call_completed",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KeelEvent::CapabilityExhausted { .. } | KeelEvent::ProtocolError { fatal: true, .. }
        )
    }
}
