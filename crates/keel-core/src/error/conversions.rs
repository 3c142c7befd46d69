//! The unified error type and conversions between boundaries.

use super::{CallError, InvalidPlan, MemoryError, PlanError, RegistryError};
use crate::handle::InvalidTransition;
use crate::validation::ValidationError;
use thiserror::Error;

/// Result type spanning every boundary.
pub type KeelResult<T> = Result<T, KeelError>;

/// Any error the orchestration core can surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeelError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("call error: {0}")]
    Call(#[from] CallError),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl From<InvalidPlan> for KeelError {
    fn from(err: InvalidPlan) -> Self {
        KeelError::Plan(PlanError::InvalidPlan(err))
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::Serialization(err.to_string())
    }
}

impl From<RegistryError> for PlanError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownTool { tool } => PlanError::UnknownTool { tool },
            RegistryError::DuplicateTool { tool } => {
                PlanError::InvalidPlan(InvalidPlan::DuplicateStep {
                    tool: tool.to_string(),
                })
            }
            RegistryError::InvalidInput { tool, reason } => {
                PlanError::InvalidPlan(InvalidPlan::InvalidInput {
                    step: tool.to_string(),
                    reason,
                })
            }
        }
    }
}

impl From<RegistryError> for CallError {
    fn from(err: RegistryError) -> Self {
        CallError::InvalidInput {
            reason: err.to_string(),
        }
    }
}

impl From<MemoryError> for CallError {
    fn from(err: MemoryError) -> Self {
        CallError::domain(err.to_string())
    }
}
