//! # Keel Tools
//!
//! The tool registry maps tool names to descriptors (input contract and the
//! capability handle that executes the tool). The `standard` module holds
//! the in-process tools the bootstrap registers by default.

pub mod registry;
pub mod schema;
pub mod standard;

pub use registry::ToolRegistry;
pub use schema::check_input;
pub use standard::{EchoTool, ExampleTool, MemoryGetTool, MemoryPutTool, standard_tools};
