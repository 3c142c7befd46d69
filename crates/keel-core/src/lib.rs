//! # Keel Core
//!
//! Core types shared by every Keel crate: validated identifiers, tool
//! descriptors and results, capability handle states, memory entries and the
//! error taxonomy of the orchestration core.

pub mod error;
pub mod handle;
pub mod identifiers;
pub mod memory;
pub mod request;
pub mod tool;
pub mod validation;

pub use error::{
    CallError, CallResult, InvalidPlan, KeelError, KeelResult, MemoryError, MemoryResult, PlanError,
    PlanResult, RegistryError, RegistryResult,
};
pub use handle::{HandleKind, HandleState, HandleStatus, InvalidTransition};
pub use identifiers::{HandleId, RequestId, ToolName};
pub use memory::{MemoryEntry, MemoryKey, MemoryValue, Namespace};
pub use request::RequestPhase;
pub use tool::{CallStatus, ExecutionResult, Tool, ToolDescriptor, ToolOutcome};
pub use validation::{IdentifierRules, ValidationError};
