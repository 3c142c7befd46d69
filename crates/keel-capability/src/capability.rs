//! What a handle executes calls against, and the lease the engine holds for
//! the duration of one call.

use crate::codec::{TOOLS_CALL, tool_call_params};
use crate::connection::RpcConnection;
use keel_core::{CallError, CallResult, HandleId, HandleKind, Tool, ToolName};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;

/// The live target behind a ready handle.
#[derive(Clone)]
pub enum Capability {
    InProcess(Arc<dyn Tool>),
    Subprocess(Arc<RpcConnection>),
}

impl Capability {
    pub fn kind(&self) -> HandleKind {
        match self {
            Capability::InProcess(_) => HandleKind::InProcess,
            Capability::Subprocess(_) => HandleKind::Subprocess,
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::InProcess(tool) => f.debug_tuple("InProcess").field(&tool.name()).finish(),
            Capability::Subprocess(conn) => f.debug_tuple("Subprocess").field(conn).finish(),
        }
    }
}

/// Borrowed access to a ready handle.
///
/// A lease does not keep the handle alive: if the handle degrades while a
/// call is in flight, the call fails with `HandleUnavailable`.
#[derive(Debug, Clone)]
pub struct HandleLease {
    handle: HandleId,
    capability: Capability,
}

impl HandleLease {
    pub(crate) fn new(handle: HandleId, capability: Capability) -> Self {
        Self { handle, capability }
    }

    pub fn handle_id(&self) -> &HandleId {
        &self.handle
    }

    pub fn kind(&self) -> HandleKind {
        self.capability.kind()
    }

    /// Invoke `tool` with `input`, giving up at `deadline`.
    pub async fn call(&self, tool: &ToolName, input: Value, deadline: Instant) -> CallResult<Value> {
        match &self.capability {
            Capability::InProcess(target) => {
                let started = Instant::now();
                match tokio::time::timeout_at(deadline, target.call(input)).await {
                    Ok(outcome) => outcome.into_result(),
                    Err(_) => Err(CallError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }),
                }
            }
            Capability::Subprocess(conn) => {
                conn.call(TOOLS_CALL, tool_call_params(tool.as_str(), input), deadline)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_core::ToolOutcome;
    use serde_json::json;
    use std::time::Duration;

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn call(&self, input: Value) -> ToolOutcome {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ToolOutcome::success(input)
        }
    }

    fn lease() -> HandleLease {
        HandleLease::new(
            HandleId::new_unchecked("inproc.sleepy"),
            Capability::InProcess(Arc::new(Sleepy)),
        )
    }

    #[tokio::test]
    async fn in_process_call_respects_deadline() {
        let lease = lease();
        assert_eq!(lease.kind(), HandleKind::InProcess);
        let result = lease
            .call(
                &ToolName::new_unchecked("sleepy"),
                json!(1),
                Instant::now() + Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(CallError::Timeout { .. })));
    }

    #[tokio::test]
    async fn in_process_call_returns_payload() {
        let result = lease()
            .call(
                &ToolName::new_unchecked("sleepy"),
                json!({"a": 1}),
                Instant::now() + Duration::from_secs(2),
            )
            .await;
        assert_eq!(result.unwrap(), json!({"a": 1}));
    }
}
