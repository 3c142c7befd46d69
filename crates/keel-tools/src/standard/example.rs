use async_trait::async_trait;
use keel_core::{Tool, ToolOutcome};
use serde_json::{Value, json};

/// Demonstration tool with two operations.
///
/// `{"operation": "greet", "name": "Ada"}` yields `"Hello, Ada!"` (name
/// defaults to `World`, operation defaults to `greet`).
/// `{"operation": "add", "a": 2, "b": 3}` yields `5.0`; operands may be
/// numbers or numeric strings and default to zero. JSON has no infinity or
/// NaN, so non-finite operands and sums are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExampleTool;

impl ExampleTool {
    pub fn new() -> Self {
        Self
    }

    fn operand(input: &Value, field: &str) -> Result<f64, String> {
        match input.get(field) {
            None | Some(Value::Null) => Ok(0.0),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| format!("'{field}' is not a finite number")),
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(n),
                Ok(_) => Err(format!("'{field}' is not a finite number: {s:?}")),
                Err(_) => Err(format!("could not convert '{field}' to a number: {s:?}")),
            },
            Some(other) => Err(format!("could not convert '{field}' to a number: {other}")),
        }
    }

    fn run(input: &Value) -> Result<Value, String> {
        let operation = input
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("greet");

        match operation {
            "greet" => {
                let name = input.get("name").and_then(Value::as_str).unwrap_or("World");
                Ok(json!(format!("Hello, {name}!")))
            }
            "add" => {
                let a = Self::operand(input, "a")?;
                let b = Self::operand(input, "b")?;
                let sum = a + b;
                if !sum.is_finite() {
                    return Err(format!("sum of {a} and {b} is not a finite number"));
                }
                Ok(json!(sum))
            }
            other => Err(format!("Unknown operation: {other}")),
        }
    }
}

#[async_trait]
impl Tool for ExampleTool {
    fn name(&self) -> &str {
        "example"
    }

    fn description(&self) -> &str {
        "An example tool that demonstrates tool functionality"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {"type": "string"},
                "name": {"type": "string"}
            }
        })
    }

    async fn call(&self, input: Value) -> ToolOutcome {
        tracing::debug!(input = %input, "Executing example tool");
        match Self::run(&input) {
            Ok(result) => ToolOutcome::success(json!({
                "result": result,
                "metadata": {
                    "operation": input.get("operation").and_then(Value::as_str).unwrap_or("greet"),
                    "input": input,
                }
            })),
            Err(message) => ToolOutcome::Failure {
                message,
                data: Some(json!({"input": input})),
            },
        }
    }
}
