//! # Keel Engine
//!
//! Turns a [`Request`] into a [`Response`]: validates the plan, resolves
//! every tool through the registry, dispatches independent steps
//! concurrently through supervisor leases, retries transient failures and
//! folds outputs into the memory store.
//!
//! ```rust,ignore
//! let request = Request::new(5_000)
//!     .step(PlanStep::new("fetch", json!({"url": "https://example.com"})))
//!     .step(PlanStep::new("summarize", json!({"text": {"$from": "fetch"}})).after("fetch"));
//! let response = engine.execute(request).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod plan;
pub mod reference;

pub use config::EngineConfig;
pub use engine::{Engine, IN_PROCESS_PREFIX};
pub use error::{RegistrationError, RegistrationResult};
pub use plan::{CompositeError, PlanStep, Request, RequestStatus, Response, ToolFailure};
pub use reference::InputRef;
