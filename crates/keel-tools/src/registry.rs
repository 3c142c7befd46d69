//! Concurrent tool registry.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use keel_core::{RegistryError, RegistryResult, ToolDescriptor, ToolName};
use serde_json::Value;
use std::sync::Arc;

/// Maps tool names to immutable descriptor snapshots.
///
/// Lookups hand out `Arc<ToolDescriptor>`, so an in-flight call keeps using
/// the descriptor it resolved even if the tool is deregistered or replaced
/// meanwhile. The map is sharded, so registration never blocks unrelated
/// lookups.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: DashMap<ToolName, Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails with `DuplicateTool` if the name is taken; the
    /// existing entry is left as it was.
    pub fn register(&self, descriptor: ToolDescriptor) -> RegistryResult<Arc<ToolDescriptor>> {
        match self.tools.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateTool {
                tool: descriptor.name,
            }),
            Entry::Vacant(slot) => {
                tracing::debug!(
                    tool = %descriptor.name,
                    handle = %descriptor.handle_ref,
                    "Registered tool"
                );
                let descriptor = Arc::new(descriptor);
                slot.insert(Arc::clone(&descriptor));
                Ok(descriptor)
            }
        }
    }

    /// Look a tool up by name.
    pub fn resolve(&self, name: &str) -> RegistryResult<Arc<ToolDescriptor>> {
        self.tools
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::UnknownTool {
                tool: name.to_string(),
            })
    }

    /// Remove a tool; returns whether it was present. Removing an unknown
    /// name is a no-op.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.tools.remove(name).is_some();
        if removed {
            tracing::debug!(tool = name, "Deregistered tool");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All descriptors, sorted by name.
    pub fn list(&self) -> Vec<Arc<ToolDescriptor>> {
        let mut tools: Vec<_> = self
            .tools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check an input against the descriptor's structural contract.
    pub fn validate_input(descriptor: &ToolDescriptor, input: &Value) -> RegistryResult<()> {
        crate::schema::check_input(&descriptor.input_schema, input).map_err(|reason| {
            RegistryError::InvalidInput {
                tool: descriptor.name.clone(),
                reason,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::HandleId;
    use serde_json::json;

    fn descriptor(name: &str, handle: &str) -> ToolDescriptor {
        ToolDescriptor::new(
            ToolName::parse(name).unwrap(),
            HandleId::parse(handle).unwrap(),
        )
    }

    #[test]
    fn resolve_returns_exact_descriptor() {
        let registry = ToolRegistry::new();
        let d = descriptor("weather", "srv")
            .with_description("Forecasts")
            .with_input_schema(json!({"type": "object", "required": ["city"]}));
        registry.register(d.clone()).unwrap();
        assert_eq!(*registry.resolve("weather").unwrap(), d);
    }

    #[test]
    fn duplicate_registration_keeps_original() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("weather", "srv-a")).unwrap();

        let err = registry.register(descriptor("weather", "srv-b")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTool { .. }));
        assert_eq!(err.tool_name(), "weather");
        assert_eq!(
            registry.resolve("weather").unwrap().handle_ref.as_str(),
            "srv-a"
        );
    }

    #[test]
    fn unknown_tool() {
        let registry = ToolRegistry::new();
        assert_eq!(
            registry.resolve("nope").unwrap_err(),
            RegistryError::UnknownTool {
                tool: "nope".into()
            }
        );
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("echo", "inproc.echo")).unwrap();
        assert!(registry.deregister("echo"));
        assert!(!registry.deregister("echo"));
        assert!(registry.is_empty());
    }

    #[test]
    fn resolved_snapshot_outlives_deregistration() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("echo", "inproc.echo")).unwrap();
        let held = registry.resolve("echo").unwrap();
        registry.deregister("echo");
        registry.register(descriptor("echo", "other")).unwrap();
        assert_eq!(held.handle_ref.as_str(), "inproc.echo");
    }

    #[test]
    fn list_is_sorted() {
        let registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(descriptor(name, "h")).unwrap();
        }
        let names: Vec<_> = registry
            .list()
            .iter()
            .map(|d| d.name.to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn validate_input_reports_tool() {
        let d = descriptor("weather", "srv")
            .with_input_schema(json!({"type": "object", "required": ["city"]}));
        let err = ToolRegistry::validate_input(&d, &json!({})).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidInput { .. }));
        assert!(ToolRegistry::validate_input(&d, &json!({"city": "Oslo"})).is_ok());
    }

    #[test]
    fn concurrent_registration_admits_one_winner() {
        let registry = Arc::new(ToolRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .register(descriptor("shared", &format!("h{i}")))
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
