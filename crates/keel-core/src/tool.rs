//! Tool contracts: what a tool looks like in the registry, how an in-process
//! tool is invoked and what a finished invocation reports.

use crate::error::{CallError, CallResult};
use crate::identifiers::{HandleId, ToolName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

/// Registry entry for a tool. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: ToolName,
    #[serde(default)]
    pub description: String,
    /// Structural contract for the input (`type`, `required`, `properties`).
    pub input_schema: Value,
    /// Capability handle that executes this tool.
    pub handle_ref: HandleId,
}

impl ToolDescriptor {
    /// Descriptor accepting any JSON object.
    pub fn new(name: ToolName, handle_ref: HandleId) -> Self {
        Self {
            name,
            description: String::new(),
            input_schema: json!({"type": "object"}),
            handle_ref,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Outcome of an in-process tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    /// Domain failure reported by the tool itself.
    Failure { message: String, data: Option<Value> },
}

impl ToolOutcome {
    pub fn success(value: Value) -> Self {
        ToolOutcome::Success(value)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        ToolOutcome::Failure {
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    pub fn into_result(self) -> CallResult<Value> {
        match self {
            ToolOutcome::Success(value) => Ok(value),
            ToolOutcome::Failure { message, data } => Err(CallError::Domain {
                code: None,
                message,
                data,
            }),
        }
    }
}

/// A tool implemented inside this process.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn call(&self, input: Value) -> ToolOutcome;
}

/// Final status of one tool in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ok,
    Error,
    Timeout,
}

/// What one tool invocation produced. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub tool_name: ToolName,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    /// Dispatch attempts made; zero when the tool was never dispatched.
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn ok(tool_name: ToolName, payload: Value, attempts: u32, elapsed: Duration) -> Self {
        Self {
            tool_name,
            status: CallStatus::Ok,
            payload: Some(payload),
            error: None,
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Failed invocation; a `Timeout` error yields `status: timeout`.
    pub fn failed(tool_name: ToolName, error: CallError, attempts: u32, elapsed: Duration) -> Self {
        let status = if error.is_timeout() {
            CallStatus::Timeout
        } else {
            CallStatus::Error
        };
        Self {
            tool_name,
            status,
            payload: None,
            error: Some(error),
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CallStatus::Ok
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}
