//! # Built-in Tools
//!
//! In-process tools available to every deployment:
//!
//! - `example`: `greet` and `add` operations
//! - `echo`: returns its input unchanged
//! - `memory_get` / `memory_put`: read and write the shared memory store

mod echo;
mod example;
mod memory;

pub use echo::EchoTool;
pub use example::ExampleTool;
pub use memory::{MemoryGetTool, MemoryPutTool};

use keel_core::Tool;
use keel_memory::MemoryStore;
use std::sync::Arc;

/// Every built-in tool, wired to `memory`.
pub fn standard_tools(memory: Arc<MemoryStore>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ExampleTool::new()),
        Arc::new(EchoTool),
        Arc::new(MemoryGetTool::new(Arc::clone(&memory))),
        Arc::new(MemoryPutTool::new(memory)),
    ]
}
