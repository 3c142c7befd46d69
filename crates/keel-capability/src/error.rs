//! Error types for the codec and the supervisor

use keel_core::{HandleId, HandleState, InvalidTransition};
use thiserror::Error;

/// Framing and message errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared body length above the configured maximum. The body is
    /// skipped and decoding continues with the next frame.
    #[error("oversized frame: {declared} bytes (limit: {max} bytes)")]
    OversizedFrame { declared: usize, max: usize },

    /// The header block cannot be parsed; the stream cannot be resynchronised.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    /// No header terminator within the header size limit.
    #[error("frame header exceeds {max} bytes")]
    HeaderTooLong { max: usize },

    /// The body is not valid JSON.
    #[error("invalid message body: {reason}")]
    InvalidBody { id: Option<u64>, reason: String },

    /// Valid JSON that is not a request, response or notification.
    #[error("invalid message: {reason}")]
    InvalidMessage { id: Option<u64>, reason: String },

    /// A response for an id with no pending call.
    #[error("response for unknown correlation id {0}")]
    UnknownCorrelationId(u64),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Errors after which the byte stream cannot be trusted any more.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedHeader(_) | ProtocolError::HeaderTooLong { .. }
        )
    }

    /// Correlation id recovered from the offending message, if any.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            ProtocolError::InvalidBody { id, .. } | ProtocolError::InvalidMessage { id, .. } => *id,
            ProtocolError::UnknownCorrelationId(id) => Some(*id),
            _ => None,
        }
    }
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupervisorError {
    #[error("unknown handle '{0}'")]
    UnknownHandle(HandleId),

    #[error("handle '{0}' is already registered")]
    DuplicateHandle(HandleId),

    /// Re-registration is only allowed once a handle is stopped.
    #[error("handle '{id}' is still {state}")]
    HandleActive { id: HandleId, state: HandleState },

    /// In-process handles have no monitor to start.
    #[error("handle '{0}' is not supervised as a subprocess")]
    NotSupervised(HandleId),

    #[error("failed to launch capability server: {0}")]
    Launch(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}
