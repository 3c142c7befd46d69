use crate::identifiers::ToolName;
use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors from the tool registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A tool with this name is already registered; the existing entry is
    /// left untouched.
    #[error("tool '{tool}' is already registered")]
    DuplicateTool { tool: ToolName },

    #[error("unknown tool '{tool}'")]
    UnknownTool { tool: String },

    #[error("input for '{tool}' rejected: {reason}")]
    InvalidInput { tool: ToolName, reason: String },
}

impl RegistryError {
    pub fn tool_name(&self) -> &str {
        match self {
            RegistryError::DuplicateTool { tool } | RegistryError::InvalidInput { tool, .. } => {
                tool.as_str()
            }
            RegistryError::UnknownTool { tool } => tool,
        }
    }
}
