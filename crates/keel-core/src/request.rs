use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of one inbound request.
///
/// `received -> resolving -> dispatching -> awaiting -> aggregating`, ending
/// in `completed` or `failed`. A request rejected while resolving goes
/// straight to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Received,
    Resolving,
    Dispatching,
    Awaiting,
    Aggregating,
    Completed,
    Failed,
}

impl RequestPhase {
    pub fn is_final(self) -> bool {
        matches!(self, RequestPhase::Completed | RequestPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestPhase::Received => "received",
            RequestPhase::Resolving => "resolving",
            RequestPhase::Dispatching => "dispatching",
            RequestPhase::Awaiting => "awaiting",
            RequestPhase::Aggregating => "aggregating",
            RequestPhase::Completed => "completed",
            RequestPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
