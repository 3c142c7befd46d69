//! Workspace facade: re-exports the `keel` crate so the integration tests
//! under `tests/` exercise the public surface the binary is built on.

pub use keel::*;
