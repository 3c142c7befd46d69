//! Wiring: builds the memory store, supervisor, registry and engine from a
//! `KeelConfig` and registers every tool explicitly.

use crate::config::{ConfigError, KeelConfig};
use keel::observability::ObservabilityError;
use keel::{
    Engine, HandleId, JsonFilePersistence, MemoryError, MemoryStore, PlanError,
    RegistrationError, SharedSink, Supervisor, ToolRegistry, standard_tools,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Errors surfaced by the binary
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Observability(#[from] ObservabilityError),

    #[error("Tool registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Memory store error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Request rejected: {0}")]
    Plan(#[from] PlanError),

    #[error("Failed to read plan '{}': {source}", path.display())]
    PlanFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid plan '{}': {source}", path.display())]
    PlanFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode response: {0}")]
    Output(#[from] serde_json::Error),
}

/// A fully wired engine plus the background tasks it relies on.
pub struct Runtime {
    pub engine: Engine,
    background: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build everything and register tools. Capability servers are
    /// registered but not launched; see [`Runtime::start_servers`].
    pub fn build(config: &KeelConfig, sink: SharedSink) -> Result<Self, CliError> {
        let mut memory = MemoryStore::builder().config(config.memory_config());
        if let Some(path) = &config.memory.path {
            memory = memory.persistence(Arc::new(JsonFilePersistence::new(path.clone())));
        }
        let memory = Arc::new(memory.build()?);

        let engine = Engine::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(Supervisor::new(config.supervisor_config(), Arc::clone(&sink))),
            Arc::clone(&memory),
            config.engine_config(),
            sink,
        );

        for tool in standard_tools(Arc::clone(&memory)) {
            engine.register_in_process(tool)?;
        }
        for server in &config.servers {
            let id = HandleId::new_unchecked(server.id.as_str());
            let descriptors = server.descriptors(&id)?;
            let registered = engine.register_server(
                id,
                Arc::new(server.launcher()),
                config.restart_policy(),
                descriptors,
            )?;
            tracing::info!(server = %server.id, tools = registered.len(), "Registered capability server");
        }

        let mut background = vec![memory.spawn_sweeper(SWEEP_INTERVAL)];
        background.extend(memory.spawn_flusher());

        Ok(Self { engine, background })
    }

    pub fn start_servers(&self) -> usize {
        self.engine.supervisor().start_all()
    }

    /// Stop capability servers and write memory out one last time.
    pub fn shutdown(self) -> Result<(), CliError> {
        self.engine.supervisor().shutdown();
        for task in &self.background {
            task.abort();
        }
        self.engine.memory().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel::NoopSink;

    #[tokio::test]
    async fn registers_standard_and_server_tools() {
        let config = KeelConfig::parse(
            r#"
            [[servers]]
            id = "search"
            command = "/nonexistent/search-server"
            tools = [{ name = "web_search" }, { name = "fetch_page" }]
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let runtime = Runtime::build(&config, Arc::new(NoopSink)).unwrap();
        let registry = runtime.engine.registry();
        assert!(registry.contains("echo"));
        assert!(registry.contains("web_search"));
        assert_eq!(
            registry.resolve("fetch_page").unwrap().handle_ref.as_str(),
            "search"
        );
        // One handle per in-process tool, one shared by both server tools.
        assert_eq!(runtime.engine.supervisor().len(), registry.len() - 1);
        runtime.shutdown().unwrap();
    }

    #[tokio::test]
    async fn tool_name_clash_with_standard_tool_fails() {
        let config = KeelConfig::parse(
            r#"
            [[servers]]
            id = "shadow"
            command = "x"
            tools = [{ name = "echo" }]
            "#,
        )
        .unwrap();
        let err = Runtime::build(&config, Arc::new(NoopSink)).err().unwrap();
        assert!(matches!(err, CliError::Registration(_)));
    }

    #[tokio::test]
    async fn memory_is_flushed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let mut config = KeelConfig::default();
        config.memory.path = Some(path.clone());

        let runtime = Runtime::build(&config, Arc::new(NoopSink)).unwrap();
        runtime
            .engine
            .memory()
            .put(
                &keel::Namespace::new_unchecked("notes"),
                &keel::MemoryKey::new_unchecked("k"),
                keel::MemoryValue::Json(serde_json::json!({"v": 1})),
                None,
            )
            .unwrap();
        runtime.shutdown().unwrap();
        assert!(path.exists());

        let reloaded = Runtime::build(&config, Arc::new(NoopSink)).unwrap();
        let value = reloaded
            .engine
            .memory()
            .get(
                &keel::Namespace::new_unchecked("notes"),
                &keel::MemoryKey::new_unchecked("k"),
            )
            .unwrap();
        assert_eq!(value.to_json(), serde_json::json!({"v": 1}));
        reloaded.shutdown().unwrap();
    }
}
