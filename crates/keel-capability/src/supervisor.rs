//! Capability handle supervision.
//!
//! The [`Supervisor`] owns every handle. In-process handles are ready as soon
//! as they are registered. Subprocess handles get a monitor task once
//! started: it launches the server, waits for its first liveness signal,
//! watches the session for exit, closure or a missed heartbeat, and
//! relaunches with exponential backoff until the failure budget runs out.
//! The failure count only resets once a session has stayed up for
//! `stable_after`; reaching `ready` alone does not.
//!
//! ```text
//! launch ─► await ready ─► ready ─► watch ─► session ends
//!    ▲                                            │
//!    └──────── backoff ◄── degraded ◄─────────────┘
//!                              │ failures >= max
//!                              ▼
//!                           stopped (CapabilityExhausted)
//! ```

use crate::capability::{Capability, HandleLease};
use crate::codec::CodecConfig;
use crate::connection::{Liveness, RpcConnection};
use crate::error::{SupervisorError, SupervisorResult};
use crate::launcher::{LaunchedProcess, Launcher};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use keel_core::{
    CallError, CallResult, HandleId, HandleKind, HandleState, HandleStatus, InvalidTransition,
    Tool,
};
use keel_observability::{EventSink, KeelEvent, SharedSink};
use rand::Rng;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Supervisor-wide settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorConfig {
    /// How long `acquire` waits for a `starting` handle.
    pub acquire_timeout: Duration,
    pub codec: CodecConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            codec: CodecConfig::default(),
        }
    }
}

/// Restart behaviour of one subprocess handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    /// Window for the first `ready` or `heartbeat` after a launch.
    pub startup_timeout: Duration,
    /// Longest allowed gap between liveness signals once ready. `None`
    /// disables heartbeat-miss detection.
    pub heartbeat_timeout: Option<Duration>,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Scale each delay by a random factor in `[0.8, 1.2]`.
    pub jitter: bool,
    /// Failures in a row before the handle is stopped for good.
    pub max_consecutive_failures: u32,
    /// How long a ready session must survive before its failure count
    /// resets.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(10),
            heartbeat_timeout: None,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            jitter: true,
            max_consecutive_failures: 5,
            stable_after: Duration::from_secs(10),
        }
    }
}

impl RestartPolicy {
    /// Delay before the restart that follows the `failures`-th failure in a
    /// row: `base * 2^(failures - 1)`, capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_cap);
        if self.jitter {
            delay
                .mul_f64(rand::rng().random_range(0.8..=1.2))
                .min(self.backoff_cap)
        } else {
            delay
        }
    }
}

/// What a handle runs.
#[derive(Clone)]
pub enum HandleSpec {
    InProcess(Arc<dyn Tool>),
    Subprocess {
        launcher: Arc<dyn Launcher>,
        policy: RestartPolicy,
    },
}

impl HandleSpec {
    pub fn kind(&self) -> HandleKind {
        match self {
            HandleSpec::InProcess(_) => HandleKind::InProcess,
            HandleSpec::Subprocess { .. } => HandleKind::Subprocess,
        }
    }
}

impl std::fmt::Debug for HandleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleSpec::InProcess(tool) => f.debug_tuple("InProcess").field(&tool.name()).finish(),
            HandleSpec::Subprocess { launcher, policy } => f
                .debug_struct("Subprocess")
                .field("launcher", &launcher.describe())
                .field("policy", policy)
                .finish(),
        }
    }
}

#[derive(Default)]
struct EntryInner {
    capability: Option<Capability>,
    last_heartbeat: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

struct HandleEntry {
    id: HandleId,
    spec: HandleSpec,
    state: watch::Sender<HandleState>,
    inner: StdMutex<EntryInner>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl HandleEntry {
    fn new(id: HandleId, spec: HandleSpec) -> Self {
        Self {
            id,
            spec,
            state: watch::Sender::new(HandleState::Starting),
            inner: StdMutex::new(EntryInner::default()),
            monitor: StdMutex::new(None),
        }
    }

    fn inner(&self) -> MutexGuard<'_, EntryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn monitor(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> HandleState {
        *self.state.borrow()
    }

    /// Apply a state change if the lifecycle allows it and emit the event.
    fn transition(&self, to: HandleState, reason: Option<String>, sink: &dyn EventSink) -> bool {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(to) {
                from = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        let Some(from) = from else {
            return false;
        };

        let why = reason.as_deref().unwrap_or("");
        match to {
            HandleState::Ready | HandleState::Starting => {
                tracing::info!(handle = %self.id, %from, %to, reason = why, "Handle state changed")
            }
            HandleState::Degraded => {
                tracing::warn!(handle = %self.id, %from, %to, reason = why, "Handle degraded")
            }
            HandleState::Stopped => {
                tracing::info!(handle = %self.id, %from, %to, reason = why, "Handle stopped")
            }
        }
        sink.emit(&KeelEvent::handle_transition(&self.id, from, to, reason));
        true
    }

    fn lease(&self) -> Option<HandleLease> {
        self.inner()
            .capability
            .clone()
            .map(|capability| HandleLease::new(self.id.clone(), capability))
    }

    fn attach(&self, capability: Capability, last_heartbeat: Option<DateTime<Utc>>) {
        let mut inner = self.inner();
        inner.capability = Some(capability);
        inner.last_heartbeat = last_heartbeat;
    }

    /// Drop the capability, shutting its connection down.
    fn detach(&self) {
        let capability = self.inner().capability.take();
        if let Some(Capability::Subprocess(conn)) = capability {
            conn.shutdown();
        }
    }

    fn touch(&self, at: Option<DateTime<Utc>>) {
        self.inner().last_heartbeat = at;
    }

    /// Clear the failure count. Returns what it was.
    fn reset_failures(&self) -> u32 {
        std::mem::take(&mut self.inner().consecutive_failures)
    }

    fn record_failure(&self) -> u32 {
        let mut inner = self.inner();
        inner.consecutive_failures += 1;
        inner.consecutive_failures
    }

    fn status(&self) -> HandleStatus {
        let inner = self.inner();
        HandleStatus {
            id: self.id.clone(),
            kind: self.spec.kind(),
            state: self.state(),
            last_heartbeat: inner.last_heartbeat,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn abort_monitor(&self) {
        if let Some(monitor) = self.monitor().take() {
            monitor.abort();
        }
    }
}

/// Owner of all capability handles.
pub struct Supervisor {
    handles: DashMap<HandleId, Arc<HandleEntry>>,
    config: SupervisorConfig,
    sink: SharedSink,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, sink: SharedSink) -> Self {
        Self {
            handles: DashMap::new(),
            config,
            sink,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Register a tool running in this process. The handle is ready at once.
    pub fn register_in_process(&self, id: HandleId, tool: Arc<dyn Tool>) -> SupervisorResult<()> {
        self.register(id, HandleSpec::InProcess(tool))
    }

    /// Register a capability server. Nothing is launched until [`start`].
    ///
    /// [`start`]: Supervisor::start
    pub fn register_subprocess(
        &self,
        id: HandleId,
        launcher: Arc<dyn Launcher>,
        policy: RestartPolicy,
    ) -> SupervisorResult<()> {
        self.register(id, HandleSpec::Subprocess { launcher, policy })
    }

    pub fn register(&self, id: HandleId, spec: HandleSpec) -> SupervisorResult<()> {
        match self.handles.entry(id.clone()) {
            Entry::Occupied(_) => Err(SupervisorError::DuplicateHandle(id)),
            Entry::Vacant(slot) => {
                let entry = Arc::new(HandleEntry::new(id, spec));
                slot.insert(Arc::clone(&entry));
                self.activate(&entry);
                Ok(())
            }
        }
    }

    /// Replace a stopped handle with a fresh one in `starting`. Subprocess
    /// handles still need [`start`](Supervisor::start).
    pub fn reregister(&self, id: HandleId, spec: HandleSpec) -> SupervisorResult<()> {
        let entry = Arc::new(HandleEntry::new(id.clone(), spec));
        match self.handles.entry(id.clone()) {
            Entry::Vacant(_) => return Err(SupervisorError::UnknownHandle(id)),
            Entry::Occupied(mut slot) => {
                let state = slot.get().state();
                if !state.is_terminal() {
                    return Err(SupervisorError::HandleActive { id, state });
                }
                slot.insert(Arc::clone(&entry));
            }
        }
        tracing::info!(handle = %id, "Handle re-registered");
        self.activate(&entry);
        Ok(())
    }

    fn activate(&self, entry: &HandleEntry) {
        tracing::debug!(handle = %entry.id, kind = %entry.spec.kind(), "Handle registered");
        if let HandleSpec::InProcess(tool) = &entry.spec {
            entry.attach(Capability::InProcess(Arc::clone(tool)), None);
            entry.transition(HandleState::Ready, None, self.sink.as_ref());
        }
    }

    fn entry(&self, id: &HandleId) -> Option<Arc<HandleEntry>> {
        self.handles.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Spawn the monitor task of a subprocess handle. Starting a handle that
    /// is already monitored is a no-op.
    pub fn start(&self, id: &HandleId) -> SupervisorResult<()> {
        let entry = self
            .entry(id)
            .ok_or_else(|| SupervisorError::UnknownHandle(id.clone()))?;
        let HandleSpec::Subprocess { launcher, policy } = &entry.spec else {
            return Err(SupervisorError::NotSupervised(id.clone()));
        };
        let state = entry.state();
        if state.is_terminal() {
            return Err(InvalidTransition {
                from: state,
                to: HandleState::Starting,
            }
            .into());
        }

        let mut monitor = entry.monitor();
        if monitor.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        tracing::info!(handle = %id, launcher = %launcher.describe(), "Starting capability server");
        let task = Monitor {
            entry: Arc::clone(&entry),
            launcher: Arc::clone(launcher),
            policy: *policy,
            codec: self.config.codec,
            sink: Arc::clone(&self.sink),
        };
        *monitor = Some(tokio::spawn(task.run()));
        Ok(())
    }

    /// Start every subprocess handle that is not running yet. Returns how
    /// many monitors were spawned.
    pub fn start_all(&self) -> usize {
        let pending: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|e| e.spec.kind() == HandleKind::Subprocess && e.monitor().is_none())
            .map(|e| e.key().clone())
            .collect();
        pending
            .iter()
            .filter(|id| self.start(id).is_ok())
            .count()
    }

    /// Borrow a ready handle.
    ///
    /// Waits up to `acquire_timeout` while the handle is `starting`. Fails
    /// fast with `HandleUnavailable` when it is `degraded` or `stopped`.
    pub async fn acquire(&self, id: &HandleId) -> CallResult<HandleLease> {
        let entry = self
            .entry(id)
            .ok_or_else(|| CallError::handle_unavailable(id, "unknown handle"))?;

        let mut state = entry.state();
        if state == HandleState::Starting {
            let mut rx = entry.state.subscribe();
            let settled = async { rx.wait_for(|s| *s != HandleState::Starting).await.map(|s| *s) };
            state = match tokio::time::timeout(self.config.acquire_timeout, settled).await {
                Ok(Ok(state)) => state,
                Ok(Err(_)) => HandleState::Stopped,
                Err(_) => {
                    return Err(CallError::handle_unavailable(
                        id,
                        format!(
                            "still starting after {}ms",
                            self.config.acquire_timeout.as_millis()
                        ),
                    ));
                }
            };
        }

        match state {
            HandleState::Ready => entry
                .lease()
                .ok_or_else(|| CallError::handle_unavailable(id, "handle has no live connection")),
            other => Err(CallError::handle_unavailable(id, format!("handle is {other}"))),
        }
    }

    /// Stop a handle for good and kill its process.
    pub fn stop(&self, id: &HandleId) -> SupervisorResult<()> {
        let entry = self
            .entry(id)
            .ok_or_else(|| SupervisorError::UnknownHandle(id.clone()))?;
        self.stop_entry(&entry, "stopped by operator");
        Ok(())
    }

    fn stop_entry(&self, entry: &HandleEntry, reason: &str) {
        entry.abort_monitor();
        entry.detach();
        entry.transition(
            HandleState::Stopped,
            Some(reason.to_string()),
            self.sink.as_ref(),
        );
    }

    /// Stop every handle.
    pub fn shutdown(&self) {
        let entries: Vec<Arc<HandleEntry>> =
            self.handles.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            self.stop_entry(&entry, "supervisor shutdown");
        }
    }

    /// Forget a handle entirely, killing its process. Returns false if it
    /// was not registered.
    pub fn remove(&self, id: &HandleId) -> bool {
        let Some((_, entry)) = self.handles.remove(id) else {
            return false;
        };
        entry.abort_monitor();
        entry.detach();
        tracing::debug!(handle = %id, "Handle removed");
        true
    }

    pub fn state(&self, id: &HandleId) -> Option<HandleState> {
        self.entry(id).map(|e| e.state())
    }

    pub fn status(&self, id: &HandleId) -> Option<HandleStatus> {
        self.entry(id).map(|e| e.status())
    }

    /// Status of every handle, ordered by id.
    pub fn snapshot(&self) -> Vec<HandleStatus> {
        let mut statuses: Vec<HandleStatus> = self.handles.iter().map(|e| e.status()).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Wait until the handle is in `target`. Returns false on timeout or if
    /// the handle is unknown.
    pub async fn wait_for_state(&self, id: &HandleId, target: HandleState, within: Duration) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let mut rx = entry.state.subscribe();
        let reached = async { rx.wait_for(|s| *s == target).await.is_ok() };
        tokio::time::timeout(within, reached).await.unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for entry in self.handles.iter() {
            entry.abort_monitor();
            entry.detach();
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("handles", &self.handles.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Per-handle restart loop.
struct Monitor {
    entry: Arc<HandleEntry>,
    launcher: Arc<dyn Launcher>,
    policy: RestartPolicy,
    codec: CodecConfig,
    sink: SharedSink,
}

impl Monitor {
    async fn run(self) {
        loop {
            let reason = self.session().await;
            if self.entry.state().is_terminal() {
                return;
            }

            let failures = self.entry.record_failure();
            if failures >= self.policy.max_consecutive_failures {
                tracing::error!(
                    handle = %self.entry.id,
                    failures,
                    reason = %reason,
                    "Capability exhausted its restart budget"
                );
                self.entry.transition(
                    HandleState::Stopped,
                    Some(format!("{failures} consecutive failures, last: {reason}")),
                    self.sink.as_ref(),
                );
                self.sink.emit(&KeelEvent::CapabilityExhausted {
                    handle: self.entry.id.clone(),
                    consecutive_failures: failures,
                });
                return;
            }

            // A handle that never became ready stays `starting`.
            self.entry
                .transition(HandleState::Degraded, Some(reason.clone()), self.sink.as_ref());

            let delay = self.policy.backoff(failures);
            tracing::warn!(
                handle = %self.entry.id,
                attempt = failures,
                backoff_ms = delay.as_millis() as u64,
                reason = %reason,
                "Scheduling capability restart"
            );
            self.sink.emit(&KeelEvent::RestartScheduled {
                handle: self.entry.id.clone(),
                attempt: failures,
                backoff_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;
        }
    }

    /// One launch through to the end of the session. Returns why it ended.
    async fn session(&self) -> String {
        let LaunchedProcess {
            reader,
            writer,
            mut child,
        } = match self.launcher.launch().await {
            Ok(process) => process,
            Err(e) => return e.to_string(),
        };
        let conn = Arc::new(RpcConnection::new(
            self.entry.id.clone(),
            reader,
            writer,
            self.codec,
            Arc::clone(&self.sink),
        ));

        let reason = match self.await_ready(&conn).await {
            Err(reason) => reason,
            Ok(()) => {
                self.entry
                    .attach(Capability::Subprocess(Arc::clone(&conn)), conn.last_signal());
                self.entry
                    .transition(HandleState::Ready, None, self.sink.as_ref());
                self.watch(&conn, &mut child).await
            }
        };

        self.entry.detach();
        conn.shutdown();
        if let Some(child) = child.as_mut() {
            let _ = child.start_kill();
        }
        reason
    }

    async fn await_ready(&self, conn: &RpcConnection) -> Result<(), String> {
        let mut liveness = conn.liveness();
        let ready = async { liveness.wait_for(|l| l.signals > 0).await.is_ok() };
        tokio::select! {
            ready = tokio::time::timeout(self.policy.startup_timeout, ready) => match ready {
                Ok(true) => Ok(()),
                Ok(false) => Err("liveness channel closed".to_string()),
                Err(_) => Err(format!(
                    "no liveness signal within {}ms of launch",
                    self.policy.startup_timeout.as_millis()
                )),
            },
            reason = conn.closed() => Err(format!("closed during startup: {reason}")),
        }
    }

    async fn watch(&self, conn: &RpcConnection, child: &mut Option<Child>) -> String {
        let mut liveness = conn.liveness();
        let stable_at = tokio::time::Instant::now() + self.policy.stable_after;
        let mut stable = false;
        loop {
            tokio::select! {
                reason = conn.closed() => return reason.to_string(),
                status = wait_child(child) => return format!("process exited: {status}"),
                _ = tokio::time::sleep_until(stable_at), if !stable => {
                    stable = true;
                    let cleared = self.entry.reset_failures();
                    if cleared > 0 {
                        tracing::info!(
                            handle = %self.entry.id,
                            cleared,
                            "Capability stable, failure count reset"
                        );
                    }
                }
                seen = next_signal(&mut liveness, self.policy.heartbeat_timeout) => {
                    if !seen {
                        let window = self.policy.heartbeat_timeout.unwrap_or_default();
                        return format!("no heartbeat within {}ms", window.as_millis());
                    }
                    self.entry.touch(conn.last_signal());
                }
            }
        }
    }
}

async fn wait_child(child: &mut Option<Child>) -> String {
    match child {
        Some(child) => match child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        },
        None => std::future::pending().await,
    }
}

/// Wait for the next liveness signal. False when `window` elapses first.
async fn next_signal(rx: &mut watch::Receiver<Liveness>, window: Option<Duration>) -> bool {
    let changed = async {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    match window {
        Some(window) => tokio::time::timeout(window, changed).await.is_ok(),
        None => {
            changed.await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeLauncher, FakeReply, FakeServer};
    use async_trait::async_trait;
    use keel_core::{ToolName, ToolOutcome};
    use serde_json::{Value, json};
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<KeelEvent>>);

    impl EventSink for Recorder {
        fn emit(&self, event: &KeelEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn names(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().iter().map(KeelEvent::name).collect()
        }
    }

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn call(&self, input: Value) -> ToolOutcome {
            let text = input["text"].as_str().unwrap_or_default().to_uppercase();
            ToolOutcome::success(json!({ "text": text }))
        }
    }

    fn fast_policy() -> RestartPolicy {
        RestartPolicy {
            startup_timeout: Duration::from_secs(1),
            heartbeat_timeout: None,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            jitter: false,
            max_consecutive_failures: 3,
            stable_after: Duration::from_millis(100),
        }
    }

    fn supervisor(sink: Arc<Recorder>) -> Supervisor {
        let config = SupervisorConfig {
            acquire_timeout: Duration::from_secs(2),
            ..SupervisorConfig::default()
        };
        Supervisor::new(config, sink)
    }

    fn id(s: &str) -> HandleId {
        HandleId::new_unchecked(s)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RestartPolicy {
            jitter: false,
            ..RestartPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(4), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jittered_backoff_stays_within_bounds() {
        let policy = RestartPolicy::default();
        for _ in 0..100 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn in_process_handles_are_ready_on_registration() {
        let sink = Arc::new(Recorder::default());
        let sup = supervisor(Arc::clone(&sink));
        sup.register_in_process(id("inproc.upper"), Arc::new(Upper))
            .unwrap();

        assert_eq!(sup.state(&id("inproc.upper")), Some(HandleState::Ready));
        let lease = sup.acquire(&id("inproc.upper")).await.unwrap();
        assert_eq!(lease.kind(), HandleKind::InProcess);
        let out = lease
            .call(&ToolName::new_unchecked("upper"), json!({"text": "hi"}), soon())
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "HI"}));
        assert_eq!(sink.names(), vec!["handle_state_changed"]);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_handles() {
        let sup = supervisor(Arc::default());
        sup.register_in_process(id("a"), Arc::new(Upper)).unwrap();
        assert_eq!(
            sup.register_in_process(id("a"), Arc::new(Upper)),
            Err(SupervisorError::DuplicateHandle(id("a")))
        );
        assert_eq!(
            sup.start(&id("a")),
            Err(SupervisorError::NotSupervised(id("a")))
        );
        assert_eq!(
            sup.stop(&id("missing")),
            Err(SupervisorError::UnknownHandle(id("missing")))
        );
        let err = sup.acquire(&id("missing")).await.unwrap_err();
        assert!(matches!(err, CallError::HandleUnavailable { .. }));
    }

    #[tokio::test]
    async fn subprocess_becomes_ready_and_serves_calls() {
        let sup = supervisor(Arc::default());
        let launcher = Arc::new(FakeLauncher::new(FakeServer::echo()));
        sup.register_subprocess(id("srv"), launcher.clone(), fast_policy())
            .unwrap();
        assert_eq!(sup.state(&id("srv")), Some(HandleState::Starting));

        sup.start(&id("srv")).unwrap();
        // acquire waits out the startup phase.
        let lease = sup.acquire(&id("srv")).await.unwrap();
        assert_eq!(lease.kind(), HandleKind::Subprocess);
        let out = lease
            .call(&ToolName::new_unchecked("echo"), json!({"x": 1}), soon())
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));

        // Starting twice does not relaunch.
        sup.start(&id("srv")).unwrap();
        assert_eq!(launcher.launches(), 1);
        let status = sup.status(&id("srv")).unwrap();
        assert_eq!(status.state, HandleState::Ready);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn crash_mid_call_degrades_then_recovers() {
        let sink = Arc::new(Recorder::default());
        let sup = supervisor(Arc::clone(&sink));
        let server = FakeServer::new(|tool, args| match tool {
            "slow" => (Duration::from_secs(5), FakeReply::Result(args.clone())),
            _ => (Duration::ZERO, FakeReply::Result(args.clone())),
        });
        let launcher = Arc::new(FakeLauncher::new(server));
        let policy = RestartPolicy {
            backoff_base: Duration::from_millis(300),
            backoff_cap: Duration::from_millis(300),
            ..fast_policy()
        };
        sup.register_subprocess(id("srv"), launcher.clone(), policy)
            .unwrap();
        sup.start(&id("srv")).unwrap();
        let lease = sup.acquire(&id("srv")).await.unwrap();

        let in_flight = tokio::spawn(async move {
            lease
                .call(&ToolName::new_unchecked("slow"), json!({}), Instant::now() + Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(launcher.crash());

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::HandleUnavailable { .. }), "{err:?}");
        assert!(
            sup.wait_for_state(&id("srv"), HandleState::Degraded, Duration::from_secs(1))
                .await
        );
        let err = sup.acquire(&id("srv")).await.unwrap_err();
        assert!(matches!(err, CallError::HandleUnavailable { .. }));

        assert!(
            sup.wait_for_state(&id("srv"), HandleState::Ready, Duration::from_secs(2))
                .await
        );
        // Ready again, but not yet stable.
        assert_eq!(sup.status(&id("srv")).unwrap().consecutive_failures, 1);
        let lease = sup.acquire(&id("srv")).await.unwrap();
        let out = lease
            .call(&ToolName::new_unchecked("fast"), json!({"ok": true}), soon())
            .await
            .unwrap();
        assert_eq!(out, json!({"ok": true}));
        assert_eq!(launcher.launches(), 2);
        assert!(sink.names().contains(&"restart_scheduled"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sup.status(&id("srv")).unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn crashing_right_after_ready_still_exhausts() {
        let sink = Arc::new(Recorder::default());
        let sup = supervisor(Arc::clone(&sink));
        let launcher = Arc::new(FakeLauncher::new(
            FakeServer::echo().with_lifetime(Duration::from_millis(5)),
        ));
        sup.register_subprocess(id("srv"), launcher.clone(), fast_policy())
            .unwrap();
        sup.start(&id("srv")).unwrap();

        assert!(
            sup.wait_for_state(&id("srv"), HandleState::Stopped, Duration::from_secs(2))
                .await
        );
        assert_eq!(launcher.launches(), 3);
        assert_eq!(sup.status(&id("srv")).unwrap().consecutive_failures, 3);

        let events = sink.0.lock().unwrap().clone();
        let backoffs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                KeelEvent::RestartScheduled { backoff_ms, .. } => Some(*backoff_ms),
                _ => None,
            })
            .collect();
        assert_eq!(backoffs, vec![10, 20]);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, KeelEvent::CapabilityExhausted { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn repeated_launch_failures_exhaust_the_handle() {
        let sink = Arc::new(Recorder::default());
        let sup = supervisor(Arc::clone(&sink));
        let launcher = Arc::new(FakeLauncher::new(FakeServer::echo()));
        launcher.fail_next(10);
        sup.register_subprocess(id("srv"), launcher.clone(), fast_policy())
            .unwrap();
        sup.start(&id("srv")).unwrap();

        assert!(
            sup.wait_for_state(&id("srv"), HandleState::Stopped, Duration::from_secs(2))
                .await
        );
        assert_eq!(launcher.launches(), 3);
        let err = sup.acquire(&id("srv")).await.unwrap_err();
        assert!(matches!(err, CallError::HandleUnavailable { .. }));

        let events = sink.0.lock().unwrap().clone();
        assert!(events.iter().any(|e| matches!(
            e,
            KeelEvent::CapabilityExhausted { consecutive_failures: 3, .. }
        )));
        // Never ready, so never degraded either.
        assert!(!events.iter().any(|e| matches!(
            e,
            KeelEvent::HandleStateChanged { to: HandleState::Degraded, .. }
        )));
    }

    #[tokio::test]
    async fn missing_ready_signal_counts_as_failure() {
        let sup = supervisor(Arc::default());
        let launcher = Arc::new(FakeLauncher::new(FakeServer::echo().without_ready()));
        let policy = RestartPolicy {
            startup_timeout: Duration::from_millis(50),
            max_consecutive_failures: 2,
            ..fast_policy()
        };
        sup.register_subprocess(id("srv"), launcher.clone(), policy)
            .unwrap();
        sup.start(&id("srv")).unwrap();

        assert!(
            sup.wait_for_state(&id("srv"), HandleState::Stopped, Duration::from_secs(2))
                .await
        );
        assert_eq!(launcher.launches(), 2);
        assert_eq!(sup.status(&id("srv")).unwrap().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn acquire_gives_up_on_a_slow_start() {
        let config = SupervisorConfig {
            acquire_timeout: Duration::from_millis(50),
            ..SupervisorConfig::default()
        };
        let sup = Supervisor::new(config, Arc::new(keel_observability::NoopSink));
        let launcher = Arc::new(FakeLauncher::new(FakeServer::echo().without_ready()));
        sup.register_subprocess(id("srv"), launcher, fast_policy())
            .unwrap();
        sup.start(&id("srv")).unwrap();

        let err = sup.acquire(&id("srv")).await.unwrap_err();
        match err {
            CallError::HandleUnavailable { reason, .. } => assert!(reason.contains("starting")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missed_heartbeat_degrades_the_handle() {
        let sup = supervisor(Arc::default());
        let launcher = Arc::new(FakeLauncher::new(FakeServer::echo()));
        let policy = RestartPolicy {
            heartbeat_timeout: Some(Duration::from_millis(50)),
            backoff_base: Duration::from_millis(300),
            backoff_cap: Duration::from_millis(300),
            ..fast_policy()
        };
        sup.register_subprocess(id("srv"), launcher, policy).unwrap();
        sup.start(&id("srv")).unwrap();

        assert!(
            sup.wait_for_state(&id("srv"), HandleState::Degraded, Duration::from_secs(1))
                .await
        );
    }

    #[tokio::test]
    async fn regular_heartbeats_keep_the_handle_ready() {
        let sup = supervisor(Arc::default());
        let launcher = Arc::new(FakeLauncher::new(
            FakeServer::echo().with_heartbeat(Duration::from_millis(10)),
        ));
        let policy = RestartPolicy {
            heartbeat_timeout: Some(Duration::from_millis(100)),
            ..fast_policy()
        };
        sup.register_subprocess(id("srv"), launcher.clone(), policy)
            .unwrap();
        sup.start(&id("srv")).unwrap();
        sup.acquire(&id("srv")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sup.state(&id("srv")), Some(HandleState::Ready));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn stop_then_reregister() {
        let sink = Arc::new(Recorder::default());
        let sup = supervisor(Arc::clone(&sink));
        let launcher = Arc::new(FakeLauncher::new(FakeServer::echo()));
        sup.register_subprocess(id("srv"), launcher.clone(), fast_policy())
            .unwrap();
        sup.start(&id("srv")).unwrap();
        sup.acquire(&id("srv")).await.unwrap();

        let spec = HandleSpec::Subprocess {
            launcher: launcher.clone(),
            policy: fast_policy(),
        };
        assert_eq!(
            sup.reregister(id("srv"), spec.clone()),
            Err(SupervisorError::HandleActive {
                id: id("srv"),
                state: HandleState::Ready
            })
        );

        sup.stop(&id("srv")).unwrap();
        assert_eq!(sup.state(&id("srv")), Some(HandleState::Stopped));
        assert!(matches!(
            sup.start(&id("srv")),
            Err(SupervisorError::Transition(_))
        ));

        sup.reregister(id("srv"), spec).unwrap();
        assert_eq!(sup.state(&id("srv")), Some(HandleState::Starting));
        sup.start(&id("srv")).unwrap();
        sup.acquire(&id("srv")).await.unwrap();
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn removed_handles_are_forgotten() {
        let sup = supervisor(Arc::default());
        let launcher = Arc::new(FakeLauncher::new(FakeServer::echo()));
        sup.register_subprocess(id("srv"), launcher.clone(), fast_policy())
            .unwrap();
        sup.start(&id("srv")).unwrap();
        sup.acquire(&id("srv")).await.unwrap();

        assert!(sup.remove(&id("srv")));
        assert!(!sup.remove(&id("srv")));
        assert_eq!(sup.state(&id("srv")), None);
        assert!(sup.acquire(&id("srv")).await.is_err());

        // The id is free again.
        sup.register_subprocess(id("srv"), launcher, fast_policy())
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_lists_every_handle_in_order() {
        let sup = supervisor(Arc::default());
        sup.register_in_process(id("b"), Arc::new(Upper)).unwrap();
        sup.register_subprocess(
            id("a"),
            Arc::new(FakeLauncher::new(FakeServer::echo())),
            fast_policy(),
        )
        .unwrap();

        let snapshot = sup.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(snapshot[0].kind, HandleKind::Subprocess);
        assert_eq!(snapshot[0].state, HandleState::Starting);
        assert_eq!(snapshot[1].state, HandleState::Ready);

        assert_eq!(sup.start_all(), 1);
        sup.shutdown();
        assert!(sup.snapshot().iter().all(|s| s.state == HandleState::Stopped));
    }
}
