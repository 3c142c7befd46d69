//! Tools exposing the shared memory store.
//!
//! Input: `{"namespace": "...", "key": "...", "value": <json>, "ttl_ms": <u64>}`;
//! `value` and `ttl_ms` are only read by `memory_put`.

use async_trait::async_trait;
use keel_core::{MemoryKey, MemoryValue, Namespace, Tool, ToolOutcome};
use keel_memory::MemoryStore;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct MemoryArgs {
    namespace: Namespace,
    key: MemoryKey,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    ttl_ms: Option<u64>,
}

fn parse_args(input: Value) -> Result<MemoryArgs, ToolOutcome> {
    serde_json::from_value(input)
        .map_err(|e| ToolOutcome::failure(format!("invalid memory arguments: {e}")))
}

fn schema(with_value: bool) -> Value {
    let mut schema = json!({
        "type": "object",
        "required": ["namespace", "key"],
        "properties": {
            "namespace": {"type": "string"},
            "key": {"type": "string"}
        }
    });
    if with_value {
        schema["required"] = json!(["namespace", "key", "value"]);
        schema["properties"]["ttl_ms"] = json!({"type": "integer"});
    }
    schema
}

/// Reads one key from the memory store.
#[derive(Debug, Clone)]
pub struct MemoryGetTool {
    store: Arc<MemoryStore>,
}

impl MemoryGetTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryGetTool {
    fn name(&self) -> &str {
        "memory_get"
    }

    fn description(&self) -> &str {
        "Read a value from the memory store"
    }

    fn input_schema(&self) -> Value {
        schema(false)
    }

    async fn call(&self, input: Value) -> ToolOutcome {
        let args = match parse_args(input) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        match self.store.get(&args.namespace, &args.key) {
            Ok(value) => ToolOutcome::success(value.to_json()),
            Err(e) => ToolOutcome::failure(e.to_string()),
        }
    }
}

/// Writes one key to the memory store.
#[derive(Debug, Clone)]
pub struct MemoryPutTool {
    store: Arc<MemoryStore>,
}

impl MemoryPutTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryPutTool {
    fn name(&self) -> &str {
        "memory_put"
    }

    fn description(&self) -> &str {
        "Write a value to the memory store"
    }

    fn input_schema(&self) -> Value {
        schema(true)
    }

    async fn call(&self, input: Value) -> ToolOutcome {
        let args = match parse_args(input) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let Some(value) = args.value else {
            return ToolOutcome::failure("memory_put requires a 'value'");
        };
        let ttl = args.ttl_ms.map(Duration::from_millis);
        match self
            .store
            .put(&args.namespace, &args.key, MemoryValue::Json(value), ttl)
        {
            Ok(()) => ToolOutcome::success(json!({
                "namespace": args.namespace,
                "key": args.key,
                "stored": true
            })),
            Err(e) => ToolOutcome::failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_memory::MemoryConfig;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(MemoryConfig::default()))
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = store();
        let put = MemoryPutTool::new(Arc::clone(&store));
        let get = MemoryGetTool::new(store);

        let out = put
            .call(json!({"namespace": "notes", "key": "today", "value": {"todo": 3}}))
            .await;
        assert!(out.is_success());

        let out = get.call(json!({"namespace": "notes", "key": "today"})).await;
        assert_eq!(out, ToolOutcome::Success(json!({"todo": 3})));
    }

    #[tokio::test]
    async fn missing_key_is_a_domain_failure() {
        let get = MemoryGetTool::new(store());
        let out = get.call(json!({"namespace": "notes", "key": "absent"})).await;
        match out {
            ToolOutcome::Failure { message, .. } => assert!(message.contains("not found")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_namespace_is_rejected() {
        let put = MemoryPutTool::new(store());
        let out = put
            .call(json!({"namespace": "../etc", "key": "k", "value": 1}))
            .await;
        assert!(!out.is_success());
    }

    #[tokio::test]
    async fn ttl_expires_value() {
        let store = store();
        let put = MemoryPutTool::new(Arc::clone(&store));
        let get = MemoryGetTool::new(store);
        put.call(json!({"namespace": "n", "key": "k", "value": 1, "ttl_ms": 0}))
            .await;
        assert!(!get.call(json!({"namespace": "n", "key": "k"})).await.is_success());
    }
}
