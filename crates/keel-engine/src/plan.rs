//! Requests, responses and plan validation.

use crate::reference::{self, InputRef};
use keel_core::{
    CallStatus, ExecutionResult, InvalidPlan, MemoryKey, Namespace, RequestId, ToolName,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

/// Inbound unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "RequestId::generate")]
    pub request_id: RequestId,
    pub plan: Vec<PlanStep>,
    /// Budget for the whole request, from the moment it is received.
    pub deadline_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_namespace: Option<String>,
}

impl Request {
    pub fn new(deadline_ms: u64) -> Self {
        Self {
            request_id: RequestId::generate(),
            plan: Vec::new(),
            deadline_ms,
            memory_namespace: None,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.request_id = id;
        self
    }

    pub fn step(mut self, step: PlanStep) -> Self {
        self.plan.push(step);
        self
    }

    pub fn memory_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.memory_namespace = Some(namespace.into());
        self
    }
}

/// One tool invocation in a plan. Steps are named by their tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool_name: String,
    #[serde(default = "empty_object")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Whether the request fails when this step does not succeed.
    #[serde(default = "required_by_default")]
    pub required: bool,
    /// Memory key the successful output is written to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_as: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn required_by_default() -> bool {
    true
}

impl PlanStep {
    pub fn new(tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
            depends_on: Vec::new(),
            required: true,
            store_as: None,
        }
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn store_as(mut self, key: impl Into<String>) -> Self {
        self.store_as = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Completed,
    Failed,
}

/// Outcome of a request. Every step of the plan has an entry in `results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub results: BTreeMap<ToolName, ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CompositeError>,
}

impl Response {
    pub fn is_completed(&self) -> bool {
        self.status == RequestStatus::Completed
    }

    pub fn result(&self, tool: &str) -> Option<&ExecutionResult> {
        self.results.get(tool)
    }
}

/// Required steps that did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeError {
    pub failures: Vec<ToolFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub tool: ToolName,
    pub status: CallStatus,
    pub reason: String,
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} required tool(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{} ({})", failure.tool, failure.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeError {}

/// A step that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
    pub name: ToolName,
    pub input: Value,
    /// Indices of the steps this one waits for.
    pub depends_on: Vec<usize>,
    pub required: bool,
    pub store_as: Option<MemoryKey>,
    /// Whether the input contains placeholders to resolve at dispatch.
    pub has_refs: bool,
}

/// Plan in dependency order, with reverse edges precomputed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ValidatedPlan {
    pub steps: Vec<Step>,
    pub dependants: Vec<Vec<usize>>,
    pub namespace: Namespace,
}

/// Check the structure of a plan. Tool resolution happens separately
/// against the registry.
pub(crate) fn validate(
    request: &Request,
    default_namespace: &Namespace,
) -> Result<ValidatedPlan, InvalidPlan> {
    if request.plan.is_empty() {
        return Err(InvalidPlan::Empty);
    }
    if request.deadline_ms == 0 {
        return Err(InvalidPlan::ZeroDeadline);
    }
    let namespace = match &request.memory_namespace {
        None => default_namespace.clone(),
        Some(ns) => Namespace::parse(ns).map_err(|e| InvalidPlan::InvalidNamespace {
            namespace: ns.clone(),
            reason: e.to_string(),
        })?,
    };

    let mut index = HashMap::with_capacity(request.plan.len());
    for (i, step) in request.plan.iter().enumerate() {
        ToolName::parse(&step.tool_name).map_err(|e| InvalidPlan::InvalidStepName {
            name: step.tool_name.clone(),
            reason: e.to_string(),
        })?;
        if index.insert(step.tool_name.as_str(), i).is_some() {
            return Err(InvalidPlan::DuplicateStep {
                tool: step.tool_name.clone(),
            });
        }
    }

    let mut steps = Vec::with_capacity(request.plan.len());
    for step in &request.plan {
        let mut depends_on = Vec::new();
        for dependency in &step.depends_on {
            let dep = *index
                .get(dependency.as_str())
                .ok_or_else(|| InvalidPlan::UnknownDependency {
                    step: step.tool_name.clone(),
                    dependency: dependency.clone(),
                })?;
            if !depends_on.contains(&dep) {
                depends_on.push(dep);
            }
        }

        let refs = reference::collect(&step.input);
        for found in &refs {
            match found {
                Err(reason) => {
                    return Err(InvalidPlan::MalformedReference {
                        step: step.tool_name.clone(),
                        reason: reason.clone(),
                    });
                }
                Ok(InputRef::From { step: source, .. }) => {
                    if !step.depends_on.iter().any(|d| d == source) {
                        return Err(InvalidPlan::UndeclaredReference {
                            step: step.tool_name.clone(),
                            source_step: source.clone(),
                        });
                    }
                }
                Ok(InputRef::Memory { .. }) => {}
            }
        }

        let store_as = step
            .store_as
            .as_deref()
            .map(MemoryKey::parse)
            .transpose()
            .map_err(|e| InvalidPlan::InvalidInput {
                step: step.tool_name.clone(),
                reason: format!("invalid store_as key: {e}"),
            })?;

        steps.push(Step {
            name: ToolName::new_unchecked(step.tool_name.clone()),
            input: step.input.clone(),
            depends_on,
            required: step.required,
            store_as,
            has_refs: !refs.is_empty(),
        });
    }

    let mut dependants = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for &dep in &step.depends_on {
            dependants[dep].push(i);
        }
    }
    check_acyclic(&steps, &dependants)?;

    Ok(ValidatedPlan {
        steps,
        dependants,
        namespace,
    })
}

/// Kahn's algorithm. Steps left with unmet dependencies are on or behind a
/// cycle.
fn check_acyclic(steps: &[Step], dependants: &[Vec<usize>]) -> Result<(), InvalidPlan> {
    let mut indegree: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
    let mut ready: VecDeque<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = ready.pop_front() {
        visited += 1;
        for &next in &dependants[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }
    if visited == steps.len() {
        return Ok(());
    }
    let mut stuck: Vec<String> = (0..steps.len())
        .filter(|&i| indegree[i] > 0)
        .map(|i| steps[i].name.to_string())
        .collect();
    stuck.sort();
    Err(InvalidPlan::Cycle { steps: stuck })
}
