//! Mocks and fixtures shared by the Troupe test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use troupe_core::config::ModelConfig;
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::{LlmClient, Observer, Tool};
use troupe_core::types::*;

/// Usage reported by every mock completion.
pub const MOCK_USAGE: TokenUsage = TokenUsage {
    input_tokens: 10,
    output_tokens: 5,
};

/// `{"finalAnswer": "<answer>"}`
pub fn final_answer(answer: &str) -> String {
    serde_json::json!({ "finalAnswer": answer }).to_string()
}

/// A model config that no real provider will ever see.
pub fn mock_model() -> ModelConfig {
    ModelConfig::new("mock", "mock-model")
}

/// Replays canned responses in order, repeating the last one forever.
pub struct ScriptedLlm {
    responses: Vec<String>,
    cursor: AtomicUsize,
    histories: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: responses.into_iter().map(String::from).collect(),
            cursor: AtomicUsize::new(0),
            histories: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Message histories received, one per call.
    pub fn histories(&self) -> Arc<Mutex<Vec<Vec<ChatMessage>>>> {
        self.histories.clone()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            self.histories.lock().unwrap().push(messages);
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            let text = self
                .responses
                .get(i)
                .or_else(|| self.responses.last())
                .cloned()
                .unwrap_or_default();
            Ok(LlmResponse {
                text,
                usage: MOCK_USAGE,
            })
        })
    }
}

/// Always fails with an `LlmRequest` error.
pub struct FailingLlm {
    message: String,
    calls: Arc<AtomicUsize>,
}

impl FailingLlm {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl LlmClient for FailingLlm {
    fn chat(
        &self,
        _config: &ModelConfig,
        _messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TroupeError::LlmRequest(self.message.clone()))
        })
    }
}

#[derive(Clone)]
struct Route {
    responses: Vec<String>,
    delay: Duration,
}

/// Answers according to which task prompt is in the history.
///
/// Each route is keyed by a marker string that appears in the task's
/// first user message. Start and end of each call are recorded as
/// `"start:<marker>"` / `"end:<marker>"` in a shared journal.
#[derive(Clone, Default)]
pub struct KeyedLlm {
    routes: Arc<Mutex<HashMap<String, Route>>>,
    cursors: Arc<Mutex<HashMap<String, usize>>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl KeyedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to `marker` with `responses`, repeating the last.
    pub fn on(self, marker: &str, responses: Vec<String>) -> Self {
        self.on_with_delay(marker, responses, Duration::ZERO)
    }

    pub fn on_with_delay(self, marker: &str, responses: Vec<String>, delay: Duration) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(marker.to_string(), Route { responses, delay });
        self
    }

    pub fn journal(&self) -> Arc<Mutex<Vec<String>>> {
        self.journal.clone()
    }

    fn route_for(&self, messages: &[ChatMessage]) -> Option<(String, Route)> {
        let prompt = messages.iter().find(|m| m.role == Role::User)?;
        let routes = self.routes.lock().unwrap();
        routes
            .iter()
            .find(|(marker, _)| prompt.content.contains(marker.as_str()))
            .map(|(marker, route)| (marker.clone(), route.clone()))
    }
}

impl LlmClient for KeyedLlm {
    fn chat(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            let (marker, route) = self
                .route_for(&messages)
                .ok_or_else(|| TroupeError::LlmRequest("no route for prompt".into()))?;
            self.journal.lock().unwrap().push(format!("start:{marker}"));
            if !route.delay.is_zero() {
                tokio::time::sleep(route.delay).await;
            }
            let i = {
                let mut cursors = self.cursors.lock().unwrap();
                let c = cursors.entry(marker.clone()).or_insert(0);
                let i = *c;
                *c += 1;
                i
            };
            let text = route
                .responses
                .get(i)
                .or_else(|| route.responses.last())
                .cloned()
                .unwrap_or_default();
            self.journal.lock().unwrap().push(format!("end:{marker}"));
            Ok(LlmResponse {
                text,
                usage: MOCK_USAGE,
            })
        })
    }
}

/// Holds every call until permits are released with [`GatedLlm::open`].
///
/// Responses are replayed in order like [`ScriptedLlm`].
#[derive(Clone)]
pub struct GatedLlm {
    gate: Arc<Semaphore>,
    responses: Arc<Vec<String>>,
    cursor: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl GatedLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            responses: Arc::new(responses.into_iter().map(String::from).collect()),
            cursor: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Let `n` pending or future calls through.
    pub fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Calls currently parked at the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Calls ever started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct WaitGuard(Arc<AtomicUsize>);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LlmClient for GatedLlm {
    fn chat(
        &self,
        _config: &ModelConfig,
        _messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _guard = WaitGuard(self.waiting.clone());
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| TroupeError::LlmRequest(e.to_string()))?;
            permit.forget();
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            let text = self
                .responses
                .get(i)
                .or_else(|| self.responses.last())
                .cloned()
                .unwrap_or_default();
            Ok(LlmResponse {
                text,
                usage: MOCK_USAGE,
            })
        })
    }
}

/// Returns its input, serialized.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back."
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move { Ok(ToolResult::success(input.to_string())) })
    }
}

/// Always fails.
pub struct FailingTool;

impl Tool for FailingTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Fails every time."
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            Err(TroupeError::ToolExecution {
                tool: "flaky".into(),
                message: "upstream unavailable".into(),
            })
        })
    }
}

/// Keeps every event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Observer for RecordingObserver {
    fn notify(&self, event: &WorkflowEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
