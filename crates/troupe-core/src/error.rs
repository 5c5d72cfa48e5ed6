use thiserror::Error;

use crate::cancel::CancelReason;
use crate::types::{TaskStatus, WorkflowStatus};

#[derive(Debug, Error)]
pub enum TroupeError {
    // Graph errors
    #[error("Dependency cycle in {graph} graph involving task '{task}'")]
    GraphCycle { graph: &'static str, task: String },

    // Lifecycle errors
    #[error("Cannot {action} workflow while it is {status}")]
    StateTransition {
        action: &'static str,
        status: WorkflowStatus,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cannot {action} task '{task}' while it is {status}")]
    InvalidTaskState {
        action: &'static str,
        task: String,
        status: TaskStatus,
    },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("Agent output could not be parsed: {0}")]
    Parse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Agent errors
    #[error("Agent exceeded max iterations ({iterations}/{max_iterations})")]
    MaxIterationsExceeded {
        iterations: usize,
        max_iterations: usize,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("Task '{task}' blocked: {reason}")]
    TaskBlocked { task: String, reason: String },

    #[error("Workflow errored: {0}")]
    WorkflowErrored(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TroupeError {
    /// Whether this error is an expected cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, TroupeError>;
