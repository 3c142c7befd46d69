//! How a capability server is brought up.

use crate::connection::{BoxedReader, BoxedWriter};
use crate::error::{SupervisorError, SupervisorResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

/// A freshly launched capability server.
pub struct LaunchedProcess {
    /// Bytes from the server (its stdout).
    pub reader: BoxedReader,
    /// Bytes to the server (its stdin).
    pub writer: BoxedWriter,
    /// The OS process, when there is one. Killed when dropped.
    pub child: Option<Child>,
}

impl LaunchedProcess {
    /// Wrap an in-memory duplex stream with no process behind it.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

impl std::fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .finish()
    }
}

/// Produces a connection to a capability server. The supervisor calls this
/// once per start and once per restart.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> SupervisorResult<LaunchedProcess>;

    /// Short description for logs.
    fn describe(&self) -> String {
        "capability server".to_string()
    }
}

/// Spawns an OS process and talks to it over stdin/stdout. Stderr lines are
/// forwarded to `tracing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLauncher {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self) -> SupervisorResult<LaunchedProcess> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::Launch(format!("failed to spawn {}: {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::Launch("server stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Launch("server stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::Launch("server stderr unavailable".to_string()))?;

        let command = self.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                tracing::warn!(server = %command, "stderr: {}", line);
            }
        });

        tracing::debug!(command = %self.command, pid = ?child.id(), "Spawned capability server");
        Ok(LaunchedProcess {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    fn describe(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
