//! Keel Memory
//!
//! Namespaced key/value storage shared by the execution engine and the tools
//! it runs. Entries may carry an expiry; expired entries are invisible to
//! reads and removed lazily on access or by a background sweep.
//!
//! Durability is pluggable through [`MemoryPersistence`]; the provided
//! [`JsonFilePersistence`] writes the whole store atomically to one file.

pub mod config;
pub mod persistence;
pub mod pipeline;
pub mod store;

pub use config::{FlushPolicy, MemoryConfig};
pub use persistence::{JsonFilePersistence, MemoryPersistence};
pub use pipeline::MemoryPipeline;
pub use store::{MemoryStore, MemoryStoreBuilder, Scan};
