//! Request execution.
//!
//! A request is validated and resolved up front, then its steps are
//! dispatched onto a `JoinSet` as soon as their dependencies succeed. Each
//! step runs its own bounded retry loop. The request deadline bounds the
//! whole run: when it passes, outstanding tasks are aborted and whatever has
//! not finished is reported as timed out.

use crate::config::EngineConfig;
use crate::error::{RegistrationError, RegistrationResult};
use crate::plan::{
    self, CompositeError, Request, RequestStatus, Response, ToolFailure, ValidatedPlan,
};
use crate::reference::{self, InputRef};
use keel_capability::{Launcher, RestartPolicy, Supervisor};
use keel_core::{
    CallError, CallResult, ExecutionResult, HandleId, MemoryValue, PlanResult, RegistryError,
    RequestId, RequestPhase, Tool, ToolDescriptor, ToolName,
};
use keel_memory::MemoryStore;
use keel_observability::{KeelEvent, SharedSink};
use keel_tools::ToolRegistry;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;

/// Prefix of the handle id given to each in-process tool.
pub const IN_PROCESS_PREFIX: &str = "inproc.";

/// Executes requests against the registry, the supervisor and the memory
/// store. Cheap to share: every request borrows it immutably.
pub struct Engine {
    registry: Arc<ToolRegistry>,
    supervisor: Arc<Supervisor>,
    memory: Arc<MemoryStore>,
    config: EngineConfig,
    sink: SharedSink,
}

impl Engine {
    pub fn new(
        registry: Arc<ToolRegistry>,
        supervisor: Arc<Supervisor>,
        memory: Arc<MemoryStore>,
        config: EngineConfig,
        sink: SharedSink,
    ) -> Self {
        Self {
            registry,
            supervisor,
            memory,
            config,
            sink,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an in-process tool under its own handle `inproc.<name>`.
    pub fn register_in_process(&self, tool: Arc<dyn Tool>) -> RegistrationResult<Arc<ToolDescriptor>> {
        let name = ToolName::parse(tool.name())?;
        if self.registry.contains(name.as_str()) {
            return Err(RegistryError::DuplicateTool { tool: name }.into());
        }
        let handle = HandleId::parse(format!("{IN_PROCESS_PREFIX}{name}"))?;
        let descriptor = ToolDescriptor::new(name, handle.clone())
            .with_description(tool.description())
            .with_input_schema(tool.input_schema());
        self.supervisor.register_in_process(handle.clone(), tool)?;
        self.registry.register(descriptor).map_err(|e| {
            self.supervisor.remove(&handle);
            RegistrationError::from(e)
        })
    }

    /// Register a capability server and the tools it serves. The handle is
    /// not started; call `Supervisor::start` or `start_all`.
    ///
    /// Registration is all or nothing: on error neither the handle nor any
    /// of its tools remain registered.
    pub fn register_server(
        &self,
        id: HandleId,
        launcher: Arc<dyn Launcher>,
        policy: RestartPolicy,
        tools: Vec<ToolDescriptor>,
    ) -> RegistrationResult<Vec<Arc<ToolDescriptor>>> {
        let taken = {
            let mut seen = HashSet::new();
            tools
                .iter()
                .find(|t| !seen.insert(t.name.as_str()) || self.registry.contains(t.name.as_str()))
                .map(|t| t.name.clone())
        };
        if let Some(tool) = taken {
            return Err(RegistryError::DuplicateTool { tool }.into());
        }
        self.supervisor
            .register_subprocess(id.clone(), launcher, policy)?;

        let mut registered = Vec::with_capacity(tools.len());
        for mut descriptor in tools {
            descriptor.handle_ref = id.clone();
            match self.registry.register(descriptor) {
                Ok(descriptor) => registered.push(descriptor),
                Err(e) => {
                    // Lost a race with another registration.
                    for descriptor in &registered {
                        self.registry.deregister(descriptor.name.as_str());
                    }
                    self.supervisor.remove(&id);
                    return Err(e.into());
                }
            }
        }
        Ok(registered)
    }

    /// Run a request to completion.
    ///
    /// Returns `Err` only when the plan is rejected before anything is
    /// dispatched. Once dispatch starts, every step is accounted for in the
    /// response, whatever happened to it.
    pub async fn execute(&self, request: Request) -> PlanResult<Response> {
        let started = Instant::now();
        let deadline = started
            .checked_add(Duration::from_millis(request.deadline_ms))
            .unwrap_or_else(|| started + Duration::from_secs(365 * 24 * 3600));
        let id = request.request_id.clone();

        self.phase(&id, RequestPhase::Received);
        self.phase(&id, RequestPhase::Resolving);
        let (plan, descriptors) = match self.resolve(&request) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(request = %id, error = %e, "Request rejected");
                self.phase(&id, RequestPhase::Failed);
                return Err(e);
            }
        };

        tracing::debug!(request = %id, steps = plan.steps.len(), "Dispatching plan");
        self.phase(&id, RequestPhase::Dispatching);
        let mut run = Run::new(self, id.clone(), plan, descriptors, started, deadline);
        run.dispatch_roots();

        self.phase(&id, RequestPhase::Awaiting);
        run.await_all().await;

        self.phase(&id, RequestPhase::Aggregating);
        let response = run.aggregate();
        let phase = match response.status {
            RequestStatus::Completed => RequestPhase::Completed,
            RequestStatus::Failed => RequestPhase::Failed,
        };
        tracing::info!(
            request = %id,
            status = ?response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request finished"
        );
        self.phase(&id, phase);
        Ok(response)
    }

    fn resolve(&self, request: &Request) -> PlanResult<(ValidatedPlan, Vec<Arc<ToolDescriptor>>)> {
        let plan = plan::validate(request, &self.config.default_namespace)?;
        let mut descriptors = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let descriptor = self.registry.resolve(step.name.as_str())?;
            // Inputs with placeholders are checked once they are filled in.
            if !step.has_refs {
                ToolRegistry::validate_input(&descriptor, &step.input)?;
            }
            descriptors.push(descriptor);
        }
        Ok((plan, descriptors))
    }

    fn phase(&self, request: &RequestId, phase: RequestPhase) {
        tracing::debug!(request = %request, %phase, "Request phase");
        self.sink.emit(&KeelEvent::RequestPhaseChanged {
            request: request.clone(),
            phase,
        });
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tools", &self.registry.len())
            .field("handles", &self.supervisor.len())
            .field("config", &self.config)
            .finish()
    }
}

/// State of one request in flight.
struct Run<'a> {
    engine: &'a Engine,
    request: RequestId,
    plan: ValidatedPlan,
    descriptors: Vec<Arc<ToolDescriptor>>,
    started: Instant,
    deadline: Instant,
    results: Vec<Option<ExecutionResult>>,
    outputs: Vec<Option<Value>>,
    /// Dependencies each step still waits for.
    waiting_on: Vec<usize>,
    attempts: Vec<Arc<AtomicU32>>,
    tasks: JoinSet<ExecutionResult>,
    task_steps: HashMap<task::Id, usize>,
}

impl<'a> Run<'a> {
    fn new(
        engine: &'a Engine,
        request: RequestId,
        plan: ValidatedPlan,
        descriptors: Vec<Arc<ToolDescriptor>>,
        started: Instant,
        deadline: Instant,
    ) -> Self {
        let n = plan.steps.len();
        let waiting_on = plan.steps.iter().map(|s| s.depends_on.len()).collect();
        Self {
            engine,
            request,
            plan,
            descriptors,
            started,
            deadline,
            results: vec![None; n],
            outputs: vec![None; n],
            waiting_on,
            attempts: (0..n).map(|_| Arc::new(AtomicU32::new(0))).collect(),
            tasks: JoinSet::new(),
            task_steps: HashMap::new(),
        }
    }

    fn dispatch_roots(&mut self) {
        for idx in 0..self.plan.steps.len() {
            if self.waiting_on[idx] == 0 && self.results[idx].is_none() {
                self.dispatch(idx);
            }
        }
    }

    fn dispatch(&mut self, idx: usize) {
        let name = self.plan.steps[idx].name.clone();
        let descriptor = Arc::clone(&self.descriptors[idx]);

        let input = if self.plan.steps[idx].has_refs {
            let filled = self.fill_input(idx).and_then(|input| {
                ToolRegistry::validate_input(&descriptor, &input)
                    .map(|()| input)
                    .map_err(|e| match e {
                        RegistryError::InvalidInput { reason, .. } => reason,
                        other => other.to_string(),
                    })
            });
            match filled {
                Ok(input) => input,
                Err(reason) => {
                    let error = CallError::InvalidInput { reason };
                    self.finish(idx, ExecutionResult::failed(name, error, 0, Duration::ZERO));
                    return;
                }
            }
        } else {
            self.plan.steps[idx].input.clone()
        };

        tracing::debug!(
            request = %self.request,
            tool = %name,
            handle = %descriptor.handle_ref,
            "Dispatching tool"
        );
        let call = StepCall {
            supervisor: Arc::clone(&self.engine.supervisor),
            sink: Arc::clone(&self.engine.sink),
            request: self.request.clone(),
            tool: name,
            handle: descriptor.handle_ref.clone(),
            input,
            call_timeout: self.engine.config.call_timeout,
            max_retries: self.engine.config.max_retries,
            retry_backoff: self.engine.config.retry_backoff,
            deadline: self.deadline,
            attempts: Arc::clone(&self.attempts[idx]),
        };
        let handle = self.tasks.spawn(call.run());
        self.task_steps.insert(handle.id(), idx);
    }

    /// Replace placeholders with dependency outputs and memory reads.
    fn fill_input(&self, idx: usize) -> Result<Value, String> {
        let steps = &self.plan.steps;
        let outputs = &self.outputs;
        let memory = &self.engine.memory;
        reference::substitute(&steps[idx].input, &mut |found: &InputRef| match found {
            InputRef::From { step, pointer } => {
                let output = steps
                    .iter()
                    .position(|s| s.name.as_str() == step)
                    .and_then(|i| outputs[i].as_ref())
                    .ok_or_else(|| format!("output of '{step}' is not available"))?;
                reference::select(output, step, pointer.as_deref())
            }
            InputRef::Memory { namespace, key } => memory
                .get(namespace, key)
                .map(|value| value.to_json())
                .map_err(|e| format!("memory reference {namespace}/{key}: {e}")),
        })
    }

    /// Record a step's result and move its dependants along.
    fn finish(&mut self, idx: usize, mut result: ExecutionResult) {
        if self.results[idx].is_some() {
            return;
        }

        let store_as = self.plan.steps[idx].store_as.clone();
        if let (Some(key), Some(payload)) = (store_as, result.payload.clone()) {
            let stored =
                self.engine
                    .memory
                    .put(&self.plan.namespace, &key, MemoryValue::Json(payload), None);
            if let Err(e) = stored {
                tracing::warn!(
                    request = %self.request,
                    tool = %result.tool_name,
                    key = %key,
                    error = %e,
                    "Failed to store tool output"
                );
                result = ExecutionResult::failed(
                    result.tool_name.clone(),
                    CallError::from(e),
                    result.attempts,
                    result.elapsed(),
                );
            }
        }

        self.emit_completed(&result);
        let ok = result.is_ok();
        if ok {
            self.outputs[idx] = result.payload.clone();
        }
        self.results[idx] = Some(result);

        let name = self.plan.steps[idx].name.clone();
        for next in self.plan.dependants[idx].clone() {
            if ok {
                self.waiting_on[next] -= 1;
                if self.waiting_on[next] == 0 && self.results[next].is_none() {
                    self.dispatch(next);
                }
            } else {
                let error = CallError::DependencyFailed {
                    dependency: name.clone(),
                };
                let skipped = self.plan.steps[next].name.clone();
                tracing::debug!(request = %self.request, tool = %skipped, dependency = %name, "Skipping tool");
                self.finish(next, ExecutionResult::failed(skipped, error, 0, Duration::ZERO));
            }
        }
    }

    async fn await_all(&mut self) {
        loop {
            let joined = tokio::time::timeout_at(self.deadline, self.tasks.join_next_with_id()).await;
            match joined {
                Err(_) => {
                    tracing::warn!(
                        request = %self.request,
                        pending = self.tasks.len(),
                        "Request deadline exceeded, cancelling pending calls"
                    );
                    self.tasks.abort_all();
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok((id, result)))) => {
                    if let Some(idx) = self.task_steps.remove(&id) {
                        self.finish(idx, result);
                    }
                }
                Ok(Some(Err(e))) => {
                    if let Some(idx) = self.task_steps.remove(&e.id()) {
                        let name = self.plan.steps[idx].name.clone();
                        let attempts = self.attempts[idx].load(Ordering::SeqCst);
                        let error = CallError::domain(format!("tool task failed: {e}"));
                        self.finish(idx, ExecutionResult::failed(name, error, attempts, Duration::ZERO));
                    }
                }
            }
        }

        let elapsed = self.started.elapsed();
        for idx in 0..self.plan.steps.len() {
            if self.results[idx].is_some() {
                continue;
            }
            let result = ExecutionResult::failed(
                self.plan.steps[idx].name.clone(),
                CallError::Timeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                },
                self.attempts[idx].load(Ordering::SeqCst),
                elapsed,
            );
            self.emit_completed(&result);
            self.results[idx] = Some(result);
        }
    }

    fn aggregate(self) -> Response {
        let mut failures = Vec::new();
        let mut results = BTreeMap::new();
        for (step, result) in self.plan.steps.into_iter().zip(self.results) {
            let result = result.unwrap_or_else(|| {
                ExecutionResult::failed(step.name.clone(), CallError::Cancelled, 0, Duration::ZERO)
            });
            if step.required && !result.is_ok() {
                failures.push(ToolFailure {
                    tool: step.name.clone(),
                    status: result.status,
                    reason: result
                        .error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                });
            }
            results.insert(step.name, result);
        }

        let (status, error) = if failures.is_empty() {
            (RequestStatus::Completed, None)
        } else {
            (RequestStatus::Failed, Some(CompositeError { failures }))
        };
        Response {
            request_id: self.request,
            status,
            results,
            error,
        }
    }

    fn emit_completed(&self, result: &ExecutionResult) {
        self.engine.sink.emit(&KeelEvent::CallCompleted {
            request: self.request.clone(),
            tool: result.tool_name.clone(),
            status: result.status,
            attempts: result.attempts,
            elapsed_ms: result.elapsed_ms,
        });
    }
}

/// One step's calls, retries included. Runs as its own task.
struct StepCall {
    supervisor: Arc<Supervisor>,
    sink: SharedSink,
    request: RequestId,
    tool: ToolName,
    handle: HandleId,
    input: Value,
    call_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    deadline: Instant,
    attempts: Arc<AtomicU32>,
}

impl StepCall {
    async fn run(self) -> ExecutionResult {
        let started = Instant::now();
        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let call_deadline = self.deadline.min(Instant::now() + self.call_timeout);
            let error = match self.call_once(call_deadline).await {
                Ok(payload) => {
                    return ExecutionResult::ok(self.tool.clone(), payload, attempt, started.elapsed());
                }
                Err(e) => e,
            };

            let retry_at = Instant::now() + self.retry_backoff;
            if !error.is_transient() || attempt > self.max_retries || retry_at >= self.deadline {
                return ExecutionResult::failed(self.tool.clone(), error, attempt, started.elapsed());
            }

            tracing::warn!(
                request = %self.request,
                tool = %self.tool,
                attempt,
                error = %error,
                "Retrying tool call"
            );
            self.sink.emit(&KeelEvent::RetryScheduled {
                request: self.request.clone(),
                tool: self.tool.clone(),
                attempt: attempt + 1,
                backoff_ms: self.retry_backoff.as_millis() as u64,
                reason: error.to_string(),
            });
            tokio::time::sleep_until(retry_at).await;
        }
    }

    async fn call_once(&self, deadline: Instant) -> CallResult<Value> {
        let started = Instant::now();
        let lease = match tokio::time::timeout_at(deadline, self.supervisor.acquire(&self.handle)).await
        {
            Ok(lease) => lease?,
            Err(_) => {
                return Err(CallError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
        };
        lease.call(&self.tool, self.input.clone(), deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStep;
    use async_trait::async_trait;
    use keel_capability::SupervisorConfig;
    use keel_capability::fake::{FakeLauncher, FakeReply, FakeServer};
    use keel_core::{CallStatus, InvalidPlan, MemoryKey, Namespace, PlanError, ToolOutcome};
    use keel_memory::{MemoryConfig, MemoryPersistence};
    use keel_observability::EventSink;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<KeelEvent>>);

    impl EventSink for Recorder {
        fn emit(&self, event: &KeelEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn phases(&self) -> Vec<RequestPhase> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    KeelEvent::RequestPhaseChanged { phase, .. } => Some(*phase),
                    _ => None,
                })
                .collect()
        }
    }

    /// Sleeps, counts calls, then answers with a fixed outcome or its input.
    struct Scripted {
        name: &'static str,
        delay: Duration,
        outcome: Option<ToolOutcome>,
        schema: Option<Value>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn echo(name: &'static str) -> Self {
            Self {
                name,
                delay: Duration::ZERO,
                outcome: None,
                schema: None,
                calls: AtomicU32::new(0),
            }
        }

        fn slow(name: &'static str, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::echo(name)
            }
        }

        fn returning(name: &'static str, outcome: ToolOutcome) -> Self {
            Self {
                outcome: Some(outcome),
                ..Self::echo(name)
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Tool for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn input_schema(&self) -> Value {
            self.schema.clone().unwrap_or_else(|| json!({"type": "object"}))
        }

        async fn call(&self, input: Value) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone().unwrap_or(ToolOutcome::Success(input))
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            call_timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_backoff: Duration::from_millis(20),
            ..EngineConfig::default()
        }
    }

    fn engine(tools: Vec<Arc<Scripted>>) -> (Engine, Arc<Recorder>) {
        engine_with(test_config(), tools)
    }

    fn engine_with(config: EngineConfig, tools: Vec<Arc<Scripted>>) -> (Engine, Arc<Recorder>) {
        let sink = Arc::new(Recorder::default());
        let supervisor = Supervisor::new(SupervisorConfig::default(), sink.clone());
        let engine = Engine::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(supervisor),
            Arc::new(MemoryStore::new(MemoryConfig::default())),
            config,
            sink.clone(),
        );
        for tool in tools {
            engine.register_in_process(tool).unwrap();
        }
        (engine, sink)
    }

    fn quick_restarts() -> RestartPolicy {
        RestartPolicy {
            startup_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(10),
            jitter: false,
            ..RestartPolicy::default()
        }
    }

    #[tokio::test]
    async fn independent_steps_run_in_parallel() {
        let tools: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|n| Arc::new(Scripted::slow(n, Duration::from_millis(200))))
            .collect();
        let (engine, sink) = engine(tools);
        let request = Request::new(5_000)
            .step(PlanStep::new("a", json!({"n": 1})))
            .step(PlanStep::new("b", json!({"n": 2})))
            .step(PlanStep::new("c", json!({"n": 3})));

        let started = std::time::Instant::now();
        let response = engine.execute(request).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(450), "{:?}", started.elapsed());

        assert!(response.is_completed());
        assert_eq!(response.results.len(), 3);
        assert_eq!(response.result("b").unwrap().payload, Some(json!({"n": 2})));
        assert_eq!(
            sink.phases(),
            vec![
                RequestPhase::Received,
                RequestPhase::Resolving,
                RequestPhase::Dispatching,
                RequestPhase::Awaiting,
                RequestPhase::Aggregating,
                RequestPhase::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn dependants_of_a_failed_step_are_never_dispatched() {
        let fetch = Arc::new(Scripted::returning("fetch", ToolOutcome::failure("upstream 503")));
        let parse = Arc::new(Scripted::echo("parse"));
        let report = Arc::new(Scripted::echo("report"));
        let side = Arc::new(Scripted::echo("side"));
        let (engine, _) = engine(vec![fetch.clone(), parse.clone(), report.clone(), side.clone()]);

        let request = Request::new(5_000)
            .step(PlanStep::new("fetch", json!({})))
            .step(PlanStep::new("parse", json!({})).after("fetch"))
            .step(PlanStep::new("report", json!({})).after("parse").optional())
            .step(PlanStep::new("side", json!({})));
        let response = engine.execute(request).await.unwrap();

        assert_eq!(response.status, RequestStatus::Failed);
        assert_eq!(parse.calls(), 0);
        assert_eq!(report.calls(), 0);
        assert_eq!(side.calls(), 1);
        assert_eq!(fetch.calls(), 1);

        let fetch_result = response.result("fetch").unwrap();
        assert_eq!(fetch_result.attempts, 1, "domain errors are not retried");
        assert_eq!(
            fetch_result.error,
            Some(CallError::Domain {
                code: None,
                message: "upstream 503".into(),
                data: None
            })
        );
        let parse_result = response.result("parse").unwrap();
        assert_eq!(parse_result.status, CallStatus::Error);
        assert_eq!(parse_result.attempts, 0);
        assert_eq!(
            parse_result.error,
            Some(CallError::DependencyFailed {
                dependency: ToolName::new_unchecked("fetch")
            })
        );
        assert_eq!(
            response.result("report").unwrap().error,
            Some(CallError::DependencyFailed {
                dependency: ToolName::new_unchecked("parse")
            })
        );

        // Optional `report` is not listed among the failures.
        let failed: Vec<&str> = response
            .error
            .as_ref()
            .unwrap()
            .failures
            .iter()
            .map(|f| f.tool.as_str())
            .collect();
        assert_eq!(failed, vec!["fetch", "parse"]);
    }

    #[tokio::test]
    async fn optional_failures_do_not_fail_the_request() {
        let flaky = Arc::new(Scripted::returning("flaky", ToolOutcome::failure("nope")));
        let (engine, _) = engine(vec![flaky, Arc::new(Scripted::echo("main"))]);
        let request = Request::new(5_000)
            .step(PlanStep::new("flaky", json!({})).optional())
            .step(PlanStep::new("main", json!({})));
        let response = engine.execute(request).await.unwrap();
        assert!(response.is_completed());
        assert_eq!(response.error, None);
        assert_eq!(response.result("flaky").unwrap().status, CallStatus::Error);
    }

    #[tokio::test]
    async fn outputs_flow_through_from_references() {
        let fetch = Arc::new(Scripted::returning(
            "fetch",
            ToolOutcome::success(json!({"title": "Keel", "tags": ["a", "b"]})),
        ));
        let (engine, _) = engine(vec![fetch, Arc::new(Scripted::echo("render"))]);
        let request = Request::new(5_000)
            .step(PlanStep::new("fetch", json!({})))
            .step(
                PlanStep::new(
                    "render",
                    json!({"heading": {"$from": "fetch", "pointer": "/title"}, "all": {"$from": "fetch"}}),
                )
                .after("fetch"),
            );
        let response = engine.execute(request).await.unwrap();
        assert!(response.is_completed());
        assert_eq!(
            response.result("render").unwrap().payload,
            Some(json!({
                "heading": "Keel",
                "all": {"title": "Keel", "tags": ["a", "b"]}
            }))
        );
    }

    #[tokio::test]
    async fn store_as_writes_and_memory_references_read() {
        let produce = Arc::new(Scripted::returning(
            "produce",
            ToolOutcome::success(json!({"answer": 42})),
        ));
        let (engine, _) = engine(vec![produce, Arc::new(Scripted::echo("consume"))]);
        let request = Request::new(5_000)
            .memory_namespace("scratch")
            .step(PlanStep::new("produce", json!({})).store_as("answer"))
            .step(
                PlanStep::new(
                    "consume",
                    json!({"value": {"$memory": {"namespace": "scratch", "key": "answer"}}}),
                )
                .after("produce"),
            );
        let response = engine.execute(request).await.unwrap();
        assert!(response.is_completed(), "{:?}", response.error);
        assert_eq!(
            response.result("consume").unwrap().payload,
            Some(json!({"value": {"answer": 42}}))
        );

        let stored = engine
            .memory()
            .get(
                &Namespace::new_unchecked("scratch"),
                &MemoryKey::new_unchecked("answer"),
            )
            .unwrap();
        assert_eq!(stored, MemoryValue::Json(json!({"answer": 42})));
    }

    #[tokio::test]
    async fn missing_memory_reference_is_invalid_input() {
        let (engine, _) = engine(vec![Arc::new(Scripted::echo("consume"))]);
        let request = Request::new(5_000).step(PlanStep::new(
            "consume",
            json!({"v": {"$memory": {"namespace": "results", "key": "nothing"}}}),
        ));
        let response = engine.execute(request).await.unwrap();
        let result = response.result("consume").unwrap();
        assert_eq!(result.attempts, 0);
        assert!(matches!(result.error, Some(CallError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn rejected_plans_have_no_side_effects() {
        let a = Arc::new(Scripted::echo("a"));
        let b = Arc::new(Scripted::echo("b"));
        let (engine, sink) = engine(vec![a.clone(), b.clone()]);

        let cyclic = Request::new(1_000)
            .step(PlanStep::new("a", json!({})).after("b").store_as("a"))
            .step(PlanStep::new("b", json!({})).after("a"));
        let err = engine.execute(cyclic).await.unwrap_err();
        assert!(matches!(err, PlanError::InvalidPlan(InvalidPlan::Cycle { .. })));

        let unknown = Request::new(1_000)
            .step(PlanStep::new("a", json!({})))
            .step(PlanStep::new("ghost", json!({})));
        let err = engine.execute(unknown).await.unwrap_err();
        assert_eq!(err, PlanError::UnknownTool { tool: "ghost".into() });

        assert_eq!(a.calls() + b.calls(), 0);
        assert!(engine.memory().is_empty());
        assert_eq!(
            &sink.phases()[..3],
            &[RequestPhase::Received, RequestPhase::Resolving, RequestPhase::Failed]
        );
    }

    #[tokio::test]
    async fn static_inputs_are_checked_before_dispatch() {
        let greet = Arc::new(Scripted {
            schema: Some(json!({"type": "object", "required": ["name"]})),
            ..Scripted::echo("greet")
        });
        let (engine, _) = engine(vec![greet.clone()]);
        let err = engine
            .execute(Request::new(1_000).step(PlanStep::new("greet", json!({}))))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlanError::InvalidPlan(InvalidPlan::InvalidInput { .. })
        ));
        assert_eq!(greet.calls(), 0);
    }

    #[tokio::test]
    async fn request_deadline_releases_the_caller() {
        let slow = Arc::new(Scripted::slow("slow", Duration::from_secs(5)));
        let (engine, _) = engine(vec![slow, Arc::new(Scripted::echo("after"))]);
        let request = Request::new(100)
            .step(PlanStep::new("slow", json!({})))
            .step(PlanStep::new("after", json!({})).after("slow"));

        let started = std::time::Instant::now();
        let response = engine.execute(request).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));

        assert_eq!(response.status, RequestStatus::Failed);
        let slow = response.result("slow").unwrap();
        assert_eq!(slow.status, CallStatus::Timeout);
        assert_eq!(slow.attempts, 1);
        // Depending on which fires first, the dependant is either cut off by
        // the request deadline or skipped because `slow` timed out.
        let after = response.result("after").unwrap();
        assert_ne!(after.status, CallStatus::Ok);
        assert_eq!(after.attempts, 0);
    }

    #[tokio::test]
    async fn call_timeouts_are_retried_while_time_remains() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let server = FakeServer::new(move |_, args| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                (Duration::from_secs(2), FakeReply::Result(args.clone()))
            } else {
                (Duration::ZERO, FakeReply::Result(args.clone()))
            }
        });
        let config = EngineConfig {
            call_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let (engine, sink) = engine_with(config, vec![]);
        let id = HandleId::new_unchecked("srv");
        engine
            .register_server(
                id.clone(),
                Arc::new(FakeLauncher::new(server)),
                quick_restarts(),
                vec![ToolDescriptor::new(ToolName::new_unchecked("lookup"), id.clone())],
            )
            .unwrap();
        engine.supervisor().start(&id).unwrap();

        let response = engine
            .execute(Request::new(5_000).step(PlanStep::new("lookup", json!({"q": 1}))))
            .await
            .unwrap();
        let result = response.result("lookup").unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(result.attempts, 2);
        assert_eq!(result.payload, Some(json!({"q": 1})));
        assert!(
            sink.0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, KeelEvent::RetryScheduled { attempt: 2, .. }))
        );
    }

    #[tokio::test]
    async fn crashed_server_is_restarted_and_the_call_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let server = FakeServer::new(move |_, args| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                (Duration::from_millis(20), FakeReply::Crash)
            } else {
                (Duration::ZERO, FakeReply::Result(args.clone()))
            }
        });
        let config = EngineConfig {
            retry_backoff: Duration::from_millis(150),
            ..test_config()
        };
        let (engine, _) = engine_with(config, vec![]);
        let id = HandleId::new_unchecked("srv");
        let launcher = Arc::new(FakeLauncher::new(server));
        engine
            .register_server(
                id.clone(),
                launcher.clone(),
                quick_restarts(),
                vec![ToolDescriptor::new(ToolName::new_unchecked("lookup"), id.clone())],
            )
            .unwrap();
        assert_eq!(engine.supervisor().start_all(), 1);

        let response = engine
            .execute(Request::new(5_000).step(PlanStep::new("lookup", json!({"q": 2}))))
            .await
            .unwrap();
        let result = response.result("lookup").unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert!(result.attempts >= 2);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (engine, _) = engine(vec![Arc::new(Scripted::echo("echo"))]);
        let err = engine
            .register_in_process(Arc::new(Scripted::echo("echo")))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::RegistrationError::Registry(RegistryError::DuplicateTool { .. })
        ));
        let descriptor = engine.registry().resolve("echo").unwrap();
        assert_eq!(descriptor.handle_ref.as_str(), "inproc.echo");
        assert_eq!(engine.supervisor().len(), 1);
        assert_eq!(
            engine.supervisor().state(&HandleId::new_unchecked("inproc.echo")),
            Some(keel_core::HandleState::Ready)
        );
    }

    #[tokio::test]
    async fn server_registration_is_all_or_nothing() {
        let (engine, _) = engine(vec![]);
        let id = HandleId::new_unchecked("srv");
        let descriptor =
            |name: &str| ToolDescriptor::new(ToolName::new_unchecked(name), id.clone());
        let launcher = Arc::new(FakeLauncher::new(FakeServer::echo()));

        let err = engine
            .register_server(
                id.clone(),
                launcher.clone(),
                quick_restarts(),
                vec![descriptor("search"), descriptor("fetch"), descriptor("search")],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            crate::RegistrationError::Registry(RegistryError::DuplicateTool { ref tool })
                if tool.as_str() == "search"
        ));
        assert!(engine.registry().is_empty());
        assert_eq!(engine.supervisor().state(&id), None);

        let registered = engine
            .register_server(
                id.clone(),
                launcher,
                quick_restarts(),
                vec![descriptor("search"), descriptor("fetch")],
            )
            .unwrap();
        assert_eq!(registered.len(), 2);
        assert_eq!(engine.supervisor().state(&id), Some(keel_core::HandleState::Starting));
    }

    /// Loads nothing, refuses every flush.
    struct BrokenDisk;

    impl MemoryPersistence for BrokenDisk {
        fn load(&self) -> keel_core::MemoryResult<Vec<keel_core::MemoryEntry>> {
            Ok(Vec::new())
        }

        fn flush(&self, _entries: &[keel_core::MemoryEntry]) -> keel_core::MemoryResult<()> {
            Err(keel_core::MemoryError::Persistence("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_store_as_leaves_nothing_in_memory() {
        let sink = Arc::new(Recorder::default());
        let memory = MemoryStore::builder()
            .persistence(Arc::new(BrokenDisk))
            .build()
            .unwrap();
        let engine = Engine::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(Supervisor::new(SupervisorConfig::default(), sink.clone())),
            Arc::new(memory),
            test_config(),
            sink,
        );
        engine
            .register_in_process(Arc::new(Scripted::echo("produce")))
            .unwrap();

        let response = engine
            .execute(
                Request::new(2_000)
                    .memory_namespace("scratch")
                    .step(PlanStep::new("produce", json!({"answer": 42})).store_as("answer")),
            )
            .await
            .unwrap();
        let result = response.result("produce").unwrap();
        assert_eq!(result.status, CallStatus::Error);
        assert!(matches!(result.error, Some(CallError::Domain { .. })), "{result:?}");

        let err = engine
            .memory()
            .get(
                &Namespace::new_unchecked("scratch"),
                &MemoryKey::new_unchecked("answer"),
            )
            .unwrap_err();
        assert!(matches!(err, keel_core::MemoryError::NotFound { .. }));

        let follow_up = engine
            .execute(Request::new(2_000).step(PlanStep::new(
                "produce",
                json!({"v": {"$memory": {"namespace": "scratch", "key": "answer"}}}),
            )))
            .await
            .unwrap();
        assert!(matches!(
            follow_up.result("produce").unwrap().error,
            Some(CallError::InvalidInput { .. })
        ));
    }
}
