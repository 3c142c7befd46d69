//! # Keel Capability
//!
//! Everything between the engine and a capability: the framed JSON-RPC
//! codec, multiplexed connections to capability servers, launchers, and the
//! [`Supervisor`] that owns handle lifecycles.

pub mod capability;
pub mod codec;
pub mod connection;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod launcher;
pub mod supervisor;

pub use capability::{Capability, HandleLease};
pub use codec::{CodecConfig, FrameDecoder, Incoming, RpcErrorObject};
pub use connection::{CloseReason, Liveness, RpcConnection};
pub use error::{ProtocolError, SupervisorError, SupervisorResult};
pub use launcher::{LaunchedProcess, Launcher, ProcessLauncher};
pub use supervisor::{HandleSpec, RestartPolicy, Supervisor, SupervisorConfig};
