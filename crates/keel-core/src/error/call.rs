//! Per-call errors.
//!
//! These are recorded in an `ExecutionResult` rather than returned to the
//! caller, so they are serializable and cheap to clone.

use crate::identifiers::{HandleId, ToolName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type for a single tool invocation.
pub type CallResult<T> = Result<T, CallError>;

/// Errors a single tool invocation can end with.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallError {
    /// The handle is not ready (starting past its deadline, degraded,
    /// stopped) or its connection went away mid-call.
    #[error("handle '{handle}' unavailable: {reason}")]
    HandleUnavailable { handle: HandleId, reason: String },

    /// Malformed frame, undecodable body or unexpected response.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The per-call deadline expired.
    #[error("call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Error reported by the tool itself, passed through verbatim.
    #[error("{message}")]
    Domain {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i64>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// The handle exhausted its restart budget.
    #[error("capability '{handle}' exhausted its restart budget")]
    CapabilityExhausted { handle: HandleId },

    /// Input rejected by the tool's structural contract.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Never dispatched because a dependency did not reach `ok`.
    #[error("dependency '{dependency}' did not succeed")]
    DependencyFailed { dependency: ToolName },

    /// Aborted before completion.
    #[error("call cancelled")]
    Cancelled,
}

impl CallError {
    pub fn handle_unavailable(handle: &HandleId, reason: impl Into<String>) -> Self {
        CallError::HandleUnavailable {
            handle: handle.clone(),
            reason: reason.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        CallError::Protocol {
            message: message.into(),
        }
    }

    pub fn domain(message: impl Into<String>) -> Self {
        CallError::Domain {
            code: None,
            message: message.into(),
            data: None,
        }
    }

    /// Eligible for the engine's bounded retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::HandleUnavailable { .. } | CallError::Protocol { .. } | CallError::Timeout { .. }
        )
    }

    /// The handle is gone for good until re-registered.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CallError::CapabilityExhausted { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }
}
