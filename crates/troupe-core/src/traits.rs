use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// LLM client: one completion per call, any provider.
pub trait LlmClient: Send + Sync + 'static {
    /// Send the full message history and receive the raw completion text.
    fn chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>>;
}

/// Something an agent can call by name.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (matched exactly against the agent's `action`).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Receives every event as it happens.
///
/// Called synchronously at the point of the state change, so
/// implementations must not block or call back into the workflow.
pub trait Observer: Send + Sync {
    fn notify(&self, event: &WorkflowEvent);
}

/// Observer that drops everything.
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn notify(&self, _event: &WorkflowEvent) {}
}
