//! Memory store and persistence errors.

use crate::validation::ValidationError;
use thiserror::Error;

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("key '{key}' not found in namespace '{namespace}'")]
    NotFound { namespace: String, key: String },

    #[error("namespace '{namespace}' is full ({max} entries)")]
    CapacityExceeded { namespace: String, max: usize },

    #[error("invalid memory identifier: {0}")]
    InvalidIdentifier(#[from] ValidationError),

    #[error("value is not valid JSON: {0}")]
    Serialization(String),

    #[error("pipeline stage '{stage}' rejected the value: {reason}")]
    Pipeline { stage: String, reason: String },

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl MemoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MemoryError::NotFound { .. })
    }
}
