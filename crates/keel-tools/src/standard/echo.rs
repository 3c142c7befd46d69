use async_trait::async_trait;
use keel_core::{Tool, ToolOutcome};
use serde_json::Value;

/// Returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns its input unchanged"
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({})
    }

    async fn call(&self, input: Value) -> ToolOutcome {
        ToolOutcome::success(input)
    }
}
