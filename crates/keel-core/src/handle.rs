//! Capability handle lifecycle states.
//!
//! A handle moves through a small, explicit state machine:
//!
//! ```text
//! starting ──► ready ◄──► degraded
//!     │          │           │
//!     └──────────┴─────┬─────┘
//!                      ▼
//!                   stopped   (terminal)
//! ```
//!
//! `stopped` is irreversible; bringing a capability back requires
//! registering a new handle.

use crate::identifiers::HandleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// How a capability is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    /// A function running inside this process.
    InProcess,
    /// An external capability server reached over its stdio.
    Subprocess,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::InProcess => write!(f, "in-process"),
            HandleKind::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// Lifecycle state of a capability handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Starting,
    Ready,
    Degraded,
    Stopped,
}

impl HandleState {
    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: HandleState) -> bool {
        use HandleState::*;
        matches!(
            (self, next),
            (Starting, Ready) | (Ready, Degraded) | (Degraded, Ready) | (Starting, Stopped)
                | (Ready, Stopped)
                | (Degraded, Stopped)
        )
    }

    /// Validate a transition, returning the new state on success.
    pub fn transition(self, next: HandleState) -> Result<HandleState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == HandleState::Stopped
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandleState::Starting => "starting",
            HandleState::Ready => "ready",
            HandleState::Degraded => "degraded",
            HandleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid handle transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: HandleState,
    pub to: HandleState,
}

/// Point-in-time view of a capability handle, as a health endpoint would
/// surface it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleStatus {
    pub id: HandleId,
    pub kind: HandleKind,
    pub state: HandleState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}
