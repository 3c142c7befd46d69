//! # Keel
//!
//! Keel is an agent orchestration core. It accepts a plan of tool calls,
//! resolves each tool to a capability handle (a function in this process or
//! an external capability server spoken to over framed JSON-RPC), runs the
//! calls concurrently under deadlines and retries, and folds results into a
//! namespaced memory store.
//!
//! ## Components
//!
//! - **[Engine]**: validates plans and dispatches steps along their dependencies
//! - **[Supervisor]**: owns capability handles, restarts crashed servers
//! - **[ToolRegistry]**: maps tool names to descriptors and handles
//! - **[MemoryStore]**: namespaced key/value store with TTL and persistence
//! - **[EventSink]**: structured lifecycle events for external collectors
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keel::{Engine, EngineConfig, MemoryConfig, MemoryStore, PlanStep, Request};
//! use keel::{Supervisor, SupervisorConfig, ToolRegistry, TracingSink, standard_tools};
//! use std::sync::Arc;
//!
//! let sink = Arc::new(TracingSink);
//! let memory = Arc::new(MemoryStore::new(MemoryConfig::default()));
//! let engine = Engine::new(
//!     Arc::new(ToolRegistry::new()),
//!     Arc::new(Supervisor::new(SupervisorConfig::default(), sink.clone())),
//!     Arc::clone(&memory),
//!     EngineConfig::default(),
//!     sink,
//! );
//! for tool in standard_tools(memory) {
//!     engine.register_in_process(tool)?;
//! }
//!
//! let response = engine
//!     .execute(Request::new(1_000).step(PlanStep::new("echo", json!({"hi": 1}))))
//!     .await?;
//! assert!(response.is_completed());
//! ```

// ============================================================================
// Module aliases for namespaced access
// ============================================================================

pub use keel_capability as capability;
pub use keel_core as core;
pub use keel_engine as engine;
pub use keel_memory as memory;
pub use keel_observability as observability;
pub use keel_tools as tools;

// ============================================================================
// Identifiers and core types
// ============================================================================

pub use keel_core::{
    HandleId, HandleKind, HandleState, HandleStatus, MemoryKey, Namespace, RequestId, ToolName,
    ValidationError,
};

pub use keel_core::{
    CallStatus, ExecutionResult, MemoryEntry, MemoryValue, RequestPhase, Tool, ToolDescriptor,
    ToolOutcome,
};

// Error types
pub use keel_core::{
    CallError, CallResult, InvalidPlan, KeelError, KeelResult, MemoryError, MemoryResult,
    PlanError, PlanResult, RegistryError, RegistryResult,
};

// ============================================================================
// Execution
// ============================================================================

pub use keel_engine::{
    CompositeError, Engine, EngineConfig, PlanStep, RegistrationError, Request, RequestStatus,
    Response, ToolFailure,
};

// ============================================================================
// Capabilities
// ============================================================================

pub use keel_capability::{
    CodecConfig, HandleLease, HandleSpec, Launcher, ProcessLauncher, ProtocolError,
    RestartPolicy, RpcConnection, Supervisor, SupervisorConfig, SupervisorError,
};

// ============================================================================
// Tools and memory
// ============================================================================

pub use keel_tools::{ToolRegistry, standard_tools};

pub use keel_memory::{
    FlushPolicy, JsonFilePersistence, MemoryConfig, MemoryPersistence, MemoryPipeline,
    MemoryStore,
};

// ============================================================================
// Observability
// ============================================================================

pub use keel_observability::{
    ChannelSink, EventSink, FanoutSink, KeelEvent, LoggingConfig, NoopSink, SharedSink,
    TracingSink, init_tracing,
};
