//! Error Types
//!
//! The error taxonomy of the orchestration core, split by the boundary that
//! produces it:
//! - `registry`: tool registration and lookup
//! - `plan`: request validation, rejected before any dispatch
//! - `call`: per-call failures recorded in an `ExecutionResult`
//! - `memory`: memory store and persistence
//! - `conversions`: the unified `KeelError` and its `From` impls

mod call;
mod conversions;
mod memory;
mod plan;
mod registry;

pub use call::{CallError, CallResult};
pub use conversions::{KeelError, KeelResult};
pub use memory::{MemoryError, MemoryResult};
pub use plan::{InvalidPlan, PlanError, PlanResult};
pub use registry::{RegistryError, RegistryResult};
