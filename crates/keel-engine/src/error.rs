//! Errors raised while wiring tools into the engine.

use keel_capability::SupervisorError;
use keel_core::{RegistryError, ValidationError};
use thiserror::Error;

pub type RegistrationResult<T> = Result<T, RegistrationError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] ValidationError),
}
