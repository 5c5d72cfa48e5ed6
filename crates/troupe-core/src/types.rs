use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
    Blocked,
    Revise,
    AwaitingValidation,
    Validated,
}

impl TaskStatus {
    /// Done or validated: the task's result is final and visible downstream.
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Done | Self::Validated)
    }

    /// Waiting to be picked up by the scheduler.
    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Todo | Self::Revise)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "TODO",
            Self::Doing => "DOING",
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
            Self::Revise => "REVISE",
            Self::AwaitingValidation => "AWAITING_VALIDATION",
            Self::Validated => "VALIDATED",
        };
        f.write_str(s)
    }
}

/// Status of the workflow as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Initial,
    Running,
    Paused,
    Resumed,
    Stopping,
    Stopped,
    Finished,
    Errored,
    Blocked,
}

impl WorkflowStatus {
    /// Terminal statuses settle any outstanding `start` call.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Errored | Self::Blocked | Self::Stopped
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "INITIAL",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Resumed => "RESUMED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Finished => "FINISHED",
            Self::Errored => "ERRORED",
            Self::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Pending,
    Processed,
}

/// Human feedback attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub content: String,
    pub status: FeedbackStatus,
    pub timestamp: DateTime<Utc>,
}

impl Feedback {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: FeedbackStatus::Pending,
            timestamp: Utc::now(),
        }
    }
}

/// A unit of work bound to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    /// Id of the agent that works on this task.
    pub agent: String,
    pub status: TaskStatus,
    /// Ids of tasks that must complete before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub allow_parallel_execution: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Append-only.
    #[serde(default)]
    pub feedback_history: Vec<Feedback>,
    #[serde(default)]
    pub is_deliverable: bool,
    #[serde(default)]
    pub external_validation_required: bool,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            description: description.into(),
            expected_output: String::new(),
            agent: agent.into(),
            status: TaskStatus::Todo,
            dependencies: vec![],
            allow_parallel_execution: false,
            result: None,
            feedback_history: vec![],
            is_deliverable: false,
            external_validation_required: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = expected.into();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn parallel(mut self, allow: bool) -> Self {
        self.allow_parallel_execution = allow;
        self
    }

    pub fn deliverable(mut self) -> Self {
        self.is_deliverable = true;
        self
    }

    pub fn requires_validation(mut self) -> Self {
        self.external_validation_required = true;
        self
    }

    /// Feedback not yet consumed by a completed attempt.
    pub fn pending_feedback(&self) -> Vec<&str> {
        self.feedback_history
            .iter()
            .filter(|f| f.status == FeedbackStatus::Pending)
            .map(|f| f.content.as_str())
            .collect()
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message in the reasoning history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Token usage reported by one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw completion from one model call.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
        }
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition rendered into the agent's instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub task_id: String,
    pub agent_id: String,
}

/// Aggregate counters for one workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub duration_ms: u64,
    pub task_count: usize,
    pub tasks_completed: usize,
    pub tasks_blocked: usize,
    pub iterations: usize,
    pub llm_calls: usize,
    pub tool_calls: usize,
    pub parse_failures: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// How a reasoning loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopEnd {
    FinalAnswer,
    Blocked,
    MaxIterations,
    Failed,
    Interrupted,
}

/// Everything observable that happens inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStatusChanged {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    TaskStatusChanged {
        task_id: String,
        agent_id: String,
        from: TaskStatus,
        to: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    IterationStarted {
        task_id: String,
        agent_id: String,
        iteration: usize,
        max_iterations: usize,
    },
    IterationFinished {
        task_id: String,
        agent_id: String,
        iteration: usize,
        max_iterations: usize,
    },
    ThinkingStarted {
        task_id: String,
        agent_id: String,
        iteration: usize,
    },
    ThinkingFinished {
        task_id: String,
        agent_id: String,
        iteration: usize,
        output: String,
        usage: TokenUsage,
    },
    OutputRejected {
        task_id: String,
        agent_id: String,
        iteration: usize,
        unparsable: bool,
        output: String,
    },
    ToolStarted {
        task_id: String,
        agent_id: String,
        tool: String,
        input: serde_json::Value,
    },
    ToolFinished {
        task_id: String,
        agent_id: String,
        tool: String,
        result: ToolResult,
    },
    FinalAnswer {
        task_id: String,
        agent_id: String,
        answer: String,
    },
    LoopFinished {
        task_id: String,
        agent_id: String,
        end: LoopEnd,
        iterations: usize,
        max_iterations: usize,
    },
    AgentError {
        task_id: String,
        agent_id: String,
        error: String,
    },
}

impl WorkflowEvent {
    /// Task the event concerns, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::WorkflowStatusChanged { .. } => None,
            Self::TaskStatusChanged { task_id, .. }
            | Self::IterationStarted { task_id, .. }
            | Self::IterationFinished { task_id, .. }
            | Self::ThinkingStarted { task_id, .. }
            | Self::ThinkingFinished { task_id, .. }
            | Self::OutputRejected { task_id, .. }
            | Self::ToolStarted { task_id, .. }
            | Self::ToolFinished { task_id, .. }
            | Self::FinalAnswer { task_id, .. }
            | Self::LoopFinished { task_id, .. }
            | Self::AgentError { task_id, .. } => Some(task_id),
        }
    }

    /// Agent the event concerns, if any.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::WorkflowStatusChanged { .. } => None,
            Self::TaskStatusChanged { agent_id, .. }
            | Self::IterationStarted { agent_id, .. }
            | Self::IterationFinished { agent_id, .. }
            | Self::ThinkingStarted { agent_id, .. }
            | Self::ThinkingFinished { agent_id, .. }
            | Self::OutputRejected { agent_id, .. }
            | Self::ToolStarted { agent_id, .. }
            | Self::ToolFinished { agent_id, .. }
            | Self::FinalAnswer { agent_id, .. }
            | Self::LoopFinished { agent_id, .. }
            | Self::AgentError { agent_id, .. } => Some(agent_id),
        }
    }
}

/// Terminal outcome handed back to `start` callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub status: WorkflowStatus,
    pub result: Option<serde_json::Value>,
    pub stats: WorkflowStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_serializes_screaming() {
        let json = serde_json::to_string(&TaskStatus::AwaitingValidation).unwrap();
        assert_eq!(json, "\"AWAITING_VALIDATION\"");
        assert_eq!(TaskStatus::AwaitingValidation.to_string(), "AWAITING_VALIDATION");
    }

    #[test]
    fn complete_and_runnable() {
        assert!(TaskStatus::Done.is_complete());
        assert!(TaskStatus::Validated.is_complete());
        assert!(!TaskStatus::AwaitingValidation.is_complete());
        assert!(TaskStatus::Revise.is_runnable());
        assert!(!TaskStatus::Doing.is_runnable());
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkflowStatus::Finished.is_terminal());
        assert!(WorkflowStatus::Stopped.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(!WorkflowStatus::Resumed.is_terminal());
    }

    #[test]
    fn pending_feedback_skips_processed() {
        let mut task = Task::new("t1", "Write", "writer");
        task.feedback_history.push(Feedback::new("shorter"));
        let mut done = Feedback::new("old");
        done.status = FeedbackStatus::Processed;
        task.feedback_history.push(done);
        assert_eq!(task.pending_feedback(), vec!["shorter"]);
    }

    #[test]
    fn event_accessors() {
        let event = WorkflowEvent::ToolStarted {
            task_id: "t1".into(),
            agent_id: "a1".into(),
            tool: "search".into(),
            input: serde_json::json!({}),
        };
        assert_eq!(event.task_id(), Some("t1"));
        assert_eq!(event.agent_id(), Some("a1"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "tool_started");
    }
}
