//! # Configuration
//!
//! `KeelConfig` is read from a TOML file and then adjusted by environment
//! variables, so a deployment can change limits without editing the file.
//!
//! ## File lookup
//! 1. the `--config` argument
//! 2. `KEEL_CONFIG`
//! 3. `keel.toml` in the working directory (optional; defaults apply when absent)
//!
//! ## Environment Variables
//! - `KEEL_LOG_LEVEL` - Log filter directive (default: info)
//! - `KEEL_LOG_JSON` - Emit JSON log lines (default: false)
//! - `KEEL_CALL_TIMEOUT_SECS` - Per-call timeout in seconds, 1-300 (default: 30)
//! - `KEEL_MAX_RETRIES` - Retries after a transient failure (default: 2)
//! - `KEEL_MEMORY_PATH` - JSON file backing the memory store
//! - `KEEL_MEMORY_MAX_ENTRIES` - Entries allowed per namespace (default: 1000)
//!
//! ## Example
//!
//! ```toml
//! [logging]
//! level = "keel_capability=debug,info"
//!
//! [tools]
//! timeout_seconds = 20
//! retry_backoff = "250ms"
//!
//! [[servers]]
//! id = "search"
//! command = "python3"
//! args = ["search_server.py"]
//!
//! [[servers.tools]]
//! name = "web_search"
//! input_schema = { type = "object", required = ["query"] }
//! ```

use keel::{
    EngineConfig, FlushPolicy, HandleId, LoggingConfig, MemoryConfig, Namespace, ProcessLauncher,
    RestartPolicy, SupervisorConfig, ToolDescriptor, ToolName,
};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

pub const DEFAULT_CONFIG_PATH: &str = "keel.toml";
pub const CONFIG_PATH_VAR: &str = "KEEL_CONFIG";

const TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1..=300;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeelConfig {
    pub logging: LoggingConfig,
    pub tools: ToolsConfig,
    pub memory: MemorySection,
    pub supervisor: SupervisorSection,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    /// Per-call timeout.
    pub timeout_seconds: u64,
    pub max_retries: u32,
    #[serde(deserialize_with = "duration")]
    pub retry_backoff: Duration,
    /// Namespace for `store_as` results when a request names none.
    pub default_namespace: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            timeout_seconds: engine.call_timeout.as_secs(),
            max_retries: engine.max_retries,
            retry_backoff: engine.retry_backoff,
            default_namespace: engine.default_namespace.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemorySection {
    /// JSON file the store is loaded from and flushed to.
    pub path: Option<PathBuf>,
    pub max_entries_per_namespace: usize,
    #[serde(deserialize_with = "optional_duration")]
    pub default_ttl: Option<Duration>,
    /// Flush on a timer instead of after every write.
    #[serde(deserialize_with = "optional_duration")]
    pub flush_interval: Option<Duration>,
}

impl Default for MemorySection {
    fn default() -> Self {
        let memory = MemoryConfig::default();
        Self {
            path: None,
            max_entries_per_namespace: memory.max_entries_per_namespace,
            default_ttl: memory.default_ttl,
            flush_interval: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSection {
    #[serde(deserialize_with = "duration")]
    pub acquire_timeout: Duration,
    #[serde(deserialize_with = "duration")]
    pub startup_timeout: Duration,
    #[serde(deserialize_with = "optional_duration")]
    pub heartbeat_timeout: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    pub backoff_base: Duration,
    #[serde(deserialize_with = "duration")]
    pub backoff_cap: Duration,
    pub jitter: bool,
    pub max_consecutive_failures: u32,
    #[serde(deserialize_with = "duration")]
    pub stable_after: Duration,
    pub max_frame_bytes: usize,
    pub pipelining: bool,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let supervisor = SupervisorConfig::default();
        let policy = RestartPolicy::default();
        Self {
            acquire_timeout: supervisor.acquire_timeout,
            startup_timeout: policy.startup_timeout,
            heartbeat_timeout: policy.heartbeat_timeout,
            backoff_base: policy.backoff_base,
            backoff_cap: policy.backoff_cap,
            jitter: policy.jitter,
            max_consecutive_failures: policy.max_consecutive_failures,
            stable_after: policy.stable_after,
            max_frame_bytes: supervisor.codec.max_frame_bytes,
            pipelining: supervisor.codec.pipelining,
        }
    }
}

/// A capability server launched as a subprocess.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub tools: Vec<ServerTool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

impl KeelConfig {
    /// Load, apply `KEEL_*` overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when an explicitly named file is missing, the
    /// file does not parse, an override is malformed or validation fails.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = env::var(CONFIG_PATH_VAR).ok().map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    tracing::debug!("No {DEFAULT_CONFIG_PATH} found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Apply `KEEL_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("KEEL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_bool(&lookup, "KEEL_LOG_JSON")? {
            self.logging.json = json;
        }
        if let Some(secs) = parse_number(&lookup, "KEEL_CALL_TIMEOUT_SECS")? {
            self.tools.timeout_seconds = secs;
        }
        if let Some(retries) = parse_number(&lookup, "KEEL_MAX_RETRIES")? {
            self.tools.max_retries = retries;
        }
        if let Some(path) = lookup("KEEL_MEMORY_PATH") {
            self.memory.path = Some(PathBuf::from(path));
        }
        if let Some(max) = parse_number(&lookup, "KEEL_MEMORY_MAX_ENTRIES")? {
            self.memory.max_entries_per_namespace = max;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !TIMEOUT_RANGE.contains(&self.tools.timeout_seconds) {
            return Err(ConfigError::ValidationError(format!(
                "tools.timeout_seconds must be between {} and {}, got {}",
                TIMEOUT_RANGE.start(),
                TIMEOUT_RANGE.end(),
                self.tools.timeout_seconds
            )));
        }
        Namespace::parse(&self.tools.default_namespace).map_err(|e| {
            ConfigError::ValidationError(format!("tools.default_namespace: {e}"))
        })?;
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "logging.level cannot be empty".to_string(),
            ));
        }
        if self.memory.max_entries_per_namespace == 0 {
            return Err(ConfigError::ValidationError(
                "memory.max_entries_per_namespace must be greater than 0".to_string(),
            ));
        }
        if self.memory.flush_interval == Some(Duration::ZERO) {
            return Err(ConfigError::ValidationError(
                "memory.flush_interval must be greater than 0".to_string(),
            ));
        }
        let supervisor = &self.supervisor;
        if supervisor.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor.max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if supervisor.backoff_base > supervisor.backoff_cap {
            return Err(ConfigError::ValidationError(
                "supervisor.backoff_base cannot exceed supervisor.backoff_cap".to_string(),
            ));
        }
        if supervisor.max_frame_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor.max_frame_bytes must be greater than 0".to_string(),
            ));
        }
        self.validate_servers()
    }

    fn validate_servers(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        let mut tools = HashSet::new();
        for server in &self.servers {
            HandleId::parse(&server.id).map_err(|e| {
                ConfigError::ValidationError(format!("server id '{}': {e}", server.id))
            })?;
            if !ids.insert(server.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "server id '{}' is declared more than once",
                    server.id
                )));
            }
            if server.command.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "server '{}' has an empty command",
                    server.id
                )));
            }
            if server.tools.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "server '{}' declares no tools",
                    server.id
                )));
            }
            for tool in &server.tools {
                ToolName::parse(&tool.name).map_err(|e| {
                    ConfigError::ValidationError(format!("tool name '{}': {e}", tool.name))
                })?;
                if !tools.insert(tool.name.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "tool '{}' is declared more than once",
                        tool.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            call_timeout: Duration::from_secs(self.tools.timeout_seconds),
            max_retries: self.tools.max_retries,
            retry_backoff: self.tools.retry_backoff,
            default_namespace: Namespace::new_unchecked(self.tools.default_namespace.clone()),
        }
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            max_entries_per_namespace: self.memory.max_entries_per_namespace,
            default_ttl: self.memory.default_ttl,
            flush_policy: match self.memory.flush_interval {
                Some(period) => FlushPolicy::Interval(period),
                None => FlushPolicy::OnWrite,
            },
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig {
            acquire_timeout: self.supervisor.acquire_timeout,
            ..SupervisorConfig::default()
        };
        config.codec.max_frame_bytes = self.supervisor.max_frame_bytes;
        config.codec.pipelining = self.supervisor.pipelining;
        config
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            startup_timeout: self.supervisor.startup_timeout,
            heartbeat_timeout: self.supervisor.heartbeat_timeout,
            backoff_base: self.supervisor.backoff_base,
            backoff_cap: self.supervisor.backoff_cap,
            jitter: self.supervisor.jitter,
            max_consecutive_failures: self.supervisor.max_consecutive_failures,
            stable_after: self.supervisor.stable_after,
        }
    }
}

impl ServerConfig {
    pub fn launcher(&self) -> ProcessLauncher {
        let mut launcher = ProcessLauncher::new(self.command.as_str()).args(&self.args);
        for (key, value) in &self.env {
            launcher = launcher.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            launcher = launcher.cwd(dir.clone());
        }
        launcher
    }

    /// Descriptors for the declared tools. `handle_ref` is filled in at
    /// registration.
    pub fn descriptors(&self, handle: &HandleId) -> Result<Vec<ToolDescriptor>, ConfigError> {
        self.tools
            .iter()
            .map(|tool| {
                let name = ToolName::parse(&tool.name)
                    .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
                let mut descriptor = ToolDescriptor::new(name, handle.clone())
                    .with_description(tool.description.as_str());
                if let Some(schema) = &tool.input_schema {
                    descriptor = descriptor.with_input_schema(schema.clone());
                }
                Ok(descriptor)
            })
            .collect()
    }
}

fn duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

fn optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    duration(deserializer).map(Some)
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!(
                    "invalid boolean value '{val}', expected true/false/1/0/yes/no/on/off"
                ),
            }),
        },
        None => Ok(None),
    }
}

fn parse_number<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid value '{val}': {e}"),
            }),
        None => Ok(None),
    }
}
