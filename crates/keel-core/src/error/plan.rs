use thiserror::Error;

/// Result type for plan validation.
pub type PlanResult<T> = Result<T, PlanError>;

/// Request rejected before any tool was dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("unknown tool '{tool}'")]
    UnknownTool { tool: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] InvalidPlan),
}

/// Why a plan is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPlan {
    #[error("plan has no steps")]
    Empty,

    #[error("deadline must be greater than zero")]
    ZeroDeadline,

    #[error("step name '{name}' is not a valid tool name: {reason}")]
    InvalidStepName { name: String, reason: String },

    #[error("tool '{tool}' appears more than once")]
    DuplicateStep { tool: String },

    #[error("step '{step}' depends on '{dependency}', which is not in the plan")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle between {}", .steps.join(", "))]
    Cycle { steps: Vec<String> },

    #[error("step '{step}' references '{source_step}' without depending on it")]
    UndeclaredReference { step: String, source_step: String },

    #[error("step '{step}' has a malformed input reference: {reason}")]
    MalformedReference { step: String, reason: String },

    #[error("step '{step}' input rejected: {reason}")]
    InvalidInput { step: String, reason: String },

    #[error("invalid memory namespace '{namespace}': {reason}")]
    InvalidNamespace { namespace: String, reason: String },
}
