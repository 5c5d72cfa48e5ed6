use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use troupe_core::cancel::{CancelReason, CancelSignal};
use troupe_core::config::{AgentConfig, ModelConfig};
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::{LlmClient, Observer};
use troupe_core::types::*;
use troupe_llm::ProviderRegistry;

use crate::parser::{classify, stringify, AgentStep};
use crate::prompts::{self, BLOCK_TASK_ACTION};
use crate::tools::ToolRegistry;

/// Who an agent is and how its loop is bounded.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub role: String,
    pub goal: String,
    pub background: String,
    pub max_iterations: usize,
    /// Demand a final answer when two iterations remain.
    pub force_final_answer: bool,
    pub allow_blocking: bool,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            role: role.into(),
            goal: String::new(),
            background: String::new(),
            max_iterations: 10,
            force_final_answer: true,
            allow_blocking: false,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            role: config.role.clone(),
            goal: config.goal.clone(),
            background: config.background.clone(),
            max_iterations: config.max_iterations,
            force_final_answer: config.force_final_answer,
            allow_blocking: config.allow_blocking,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_force_final_answer(mut self, force: bool) -> Self {
        self.force_final_answer = force;
        self
    }

    pub fn with_blocking(mut self, allow: bool) -> Self {
        self.allow_blocking = allow;
        self
    }
}

/// Everything the loop needs to know about one task attempt.
#[derive(Debug, Clone)]
pub struct TaskBrief {
    pub task_id: String,
    pub description: String,
    pub expected_output: String,
    /// Rendered results of completed upstream tasks.
    pub context: Option<String>,
    /// Pending reviewer feedback.
    pub feedback: Vec<String>,
    /// Continue a paused attempt of the same task if one is held.
    pub resume: bool,
}

/// How one call to [`Agent::work_on_task`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Finished {
        answer: String,
        iterations: usize,
        max_iterations: usize,
    },
    /// Iterations consumed without a final answer.
    Exhausted {
        iterations: usize,
        max_iterations: usize,
    },
    /// The model call failed.
    Failed {
        error: String,
        iterations: usize,
        max_iterations: usize,
    },
    /// The agent used `block_task`.
    Blocked {
        reason: String,
        iterations: usize,
        max_iterations: usize,
    },
    Interrupted {
        reason: CancelReason,
        iterations: usize,
        max_iterations: usize,
    },
}

impl LoopOutcome {
    pub fn end(&self) -> LoopEnd {
        match self {
            Self::Finished { .. } => LoopEnd::FinalAnswer,
            Self::Exhausted { .. } => LoopEnd::MaxIterations,
            Self::Failed { .. } => LoopEnd::Failed,
            Self::Blocked { .. } => LoopEnd::Blocked,
            Self::Interrupted { .. } => LoopEnd::Interrupted,
        }
    }

    pub fn iterations(&self) -> usize {
        match self {
            Self::Finished { iterations, .. }
            | Self::Exhausted { iterations, .. }
            | Self::Failed { iterations, .. }
            | Self::Blocked { iterations, .. }
            | Self::Interrupted { iterations, .. } => *iterations,
        }
    }
}

/// Reasoning state owned by the attempt in progress.
#[derive(Default)]
struct LoopState {
    task_id: Option<String>,
    messages: Vec<ChatMessage>,
    iterations: usize,
}

/// What one iteration produced.
enum Turn {
    Feedback(String),
    Answer(String),
    Block(String),
}

/// Why an iteration did not produce a turn.
enum Halt {
    Cancelled(CancelReason),
    Llm(TroupeError),
}

/// A configured model + tool set running the think/act/observe loop.
///
/// One attempt at a time: concurrent work for the same agent goes to a
/// [`fork`](Agent::fork).
pub struct Agent {
    profile: AgentProfile,
    model: ModelConfig,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    state: Mutex<LoopState>,
}

impl Agent {
    pub fn new(
        profile: AgentProfile,
        model: ModelConfig,
        llm: Arc<dyn LlmClient>,
        tools: ToolRegistry,
    ) -> Self {
        Self {
            profile,
            model,
            llm,
            tools: Arc::new(tools),
            state: Mutex::new(LoopState::default()),
        }
    }

    /// Build an agent from config, resolving its client once through `providers`.
    pub fn from_config(
        config: &AgentConfig,
        models: &HashMap<String, ModelConfig>,
        providers: &ProviderRegistry,
        tools: &ToolRegistry,
    ) -> Result<Self> {
        let model = models.get(&config.model).ok_or_else(|| {
            TroupeError::Config(format!(
                "Agent '{}' uses undefined model '{}'",
                config.id, config.model
            ))
        })?;
        let (llm, model) = providers.create_client(model)?;
        let tools = tools.subset(&config.tools)?;
        Ok(Self::new(AgentProfile::from_config(config), model, llm, tools))
    }

    pub fn id(&self) -> &str {
        &self.profile.id
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Same configuration and tools, fresh reasoning state.
    pub fn fork(&self) -> Self {
        Self {
            profile: self.profile.clone(),
            model: self.model.clone(),
            llm: self.llm.clone(),
            tools: self.tools.clone(),
            state: Mutex::new(LoopState::default()),
        }
    }

    /// Drop any held reasoning state. Waits for a running attempt to exit.
    pub async fn reset(&self) {
        *self.state.lock().await = LoopState::default();
    }

    /// Iterations counted by the held attempt, if any.
    pub async fn held_iterations(&self) -> usize {
        self.state.lock().await.iterations
    }

    /// Run the reasoning loop for one task until it ends or `signal` fires.
    ///
    /// A pause keeps the message history so a later call with
    /// `brief.resume` continues where this one stopped; every other
    /// ending clears it.
    pub async fn work_on_task(
        &self,
        brief: &TaskBrief,
        signal: &CancelSignal,
        observer: &dyn Observer,
    ) -> LoopOutcome {
        let mut state = self.state.lock().await;
        let max_iterations = self.profile.max_iterations;

        let held = state.task_id.as_deref() == Some(brief.task_id.as_str())
            && !state.messages.is_empty();
        if brief.resume && held {
            info!(
                task_id = %brief.task_id,
                agent = %self.profile.id,
                iterations = state.iterations,
                "Resuming reasoning loop"
            );
        } else {
            let system = prompts::system_message(&self.profile, &self.tools.definitions());
            *state = LoopState {
                task_id: Some(brief.task_id.clone()),
                messages: vec![
                    ChatMessage::system(system),
                    ChatMessage::user(prompts::initial_message(&self.profile, brief)),
                ],
                iterations: 0,
            };
            debug!(task_id = %brief.task_id, agent = %self.profile.id, "Starting reasoning loop");
        }

        let ctx = ToolContext {
            task_id: brief.task_id.clone(),
            agent_id: self.profile.id.clone(),
        };

        loop {
            if state.iterations >= max_iterations {
                warn!(
                    task_id = %brief.task_id,
                    agent = %self.profile.id,
                    max_iterations,
                    "Agent ran out of iterations"
                );
                let outcome = LoopOutcome::Exhausted {
                    iterations: state.iterations,
                    max_iterations,
                };
                *state = LoopState::default();
                return self.finish(brief, observer, outcome);
            }

            let iteration = state.iterations + 1;
            observer.notify(&WorkflowEvent::IterationStarted {
                task_id: brief.task_id.clone(),
                agent_id: self.profile.id.clone(),
                iteration,
                max_iterations,
            });

            let turn = self
                .iterate(&state.messages, iteration, &ctx, signal, observer)
                .await;

            let (raw, turn) = match turn {
                Ok(done) => done,
                Err(Halt::Cancelled(reason)) => {
                    info!(
                        task_id = %brief.task_id,
                        agent = %self.profile.id,
                        %reason,
                        "Reasoning loop interrupted"
                    );
                    let iterations = state.iterations;
                    if reason != CancelReason::Paused {
                        *state = LoopState::default();
                    }
                    return self.finish(
                        brief,
                        observer,
                        LoopOutcome::Interrupted {
                            reason,
                            iterations,
                            max_iterations,
                        },
                    );
                }
                Err(Halt::Llm(e)) => {
                    warn!(task_id = %brief.task_id, agent = %self.profile.id, error = %e, "LLM call failed");
                    observer.notify(&WorkflowEvent::AgentError {
                        task_id: brief.task_id.clone(),
                        agent_id: self.profile.id.clone(),
                        error: e.to_string(),
                    });
                    let iterations = state.iterations;
                    *state = LoopState::default();
                    return self.finish(
                        brief,
                        observer,
                        LoopOutcome::Failed {
                            error: e.to_string(),
                            iterations,
                            max_iterations,
                        },
                    );
                }
            };

            state.messages.push(ChatMessage::assistant(raw));
            state.iterations = iteration;

            observer.notify(&WorkflowEvent::IterationFinished {
                task_id: brief.task_id.clone(),
                agent_id: self.profile.id.clone(),
                iteration,
                max_iterations,
            });

            let feedback = match turn {
                Turn::Feedback(feedback) => feedback,
                Turn::Answer(answer) => {
                    *state = LoopState::default();
                    return self.finish(
                        brief,
                        observer,
                        LoopOutcome::Finished {
                            answer,
                            iterations: iteration,
                            max_iterations,
                        },
                    );
                }
                Turn::Block(reason) => {
                    *state = LoopState::default();
                    return self.finish(
                        brief,
                        observer,
                        LoopOutcome::Blocked {
                            reason,
                            iterations: iteration,
                            max_iterations,
                        },
                    );
                }
            };

            let feedback =
                if self.profile.force_final_answer && max_iterations.saturating_sub(iteration) == 2 {
                    debug!(task_id = %brief.task_id, iteration, "Forcing final answer");
                    prompts::force_final_answer()
                } else {
                    feedback
                };
            state.messages.push(ChatMessage::user(feedback));
        }
    }

    /// One think/act/observe step over the committed history.
    async fn iterate(
        &self,
        messages: &[ChatMessage],
        iteration: usize,
        ctx: &ToolContext,
        signal: &CancelSignal,
        observer: &dyn Observer,
    ) -> std::result::Result<(String, Turn), Halt> {
        let task_id = &ctx.task_id;
        let agent_id = &ctx.agent_id;

        observer.notify(&WorkflowEvent::ThinkingStarted {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
            iteration,
        });

        let response = tokio::select! {
            biased;
            reason = signal.cancelled() => return Err(Halt::Cancelled(reason)),
            result = self.llm.chat(&self.model, messages.to_vec()) => result.map_err(Halt::Llm)?,
        };

        observer.notify(&WorkflowEvent::ThinkingFinished {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
            iteration,
            output: response.text.clone(),
            usage: response.usage,
        });

        let raw = response.text;
        let turn = match classify(&raw) {
            AgentStep::Unparsable => {
                debug!(task_id = %task_id, iteration, "Unparsable agent output");
                observer.notify(&WorkflowEvent::OutputRejected {
                    task_id: task_id.clone(),
                    agent_id: agent_id.clone(),
                    iteration,
                    unparsable: true,
                    output: raw.clone(),
                });
                Turn::Feedback(prompts::invalid_json())
            }
            AgentStep::FinalAnswer { answer } => {
                observer.notify(&WorkflowEvent::FinalAnswer {
                    task_id: task_id.clone(),
                    agent_id: agent_id.clone(),
                    answer: answer.clone(),
                });
                Turn::Answer(answer)
            }
            AgentStep::Thought { thought } => Turn::Feedback(prompts::thought(&thought)),
            AgentStep::SelfQuestion { question } => {
                Turn::Feedback(prompts::self_question(&question))
            }
            AgentStep::ToolAction { tool, input }
                if tool == BLOCK_TASK_ACTION && self.profile.allow_blocking =>
            {
                let reason = input
                    .get("reason")
                    .map(stringify)
                    .unwrap_or_else(|| stringify(&input));
                info!(task_id = %task_id, agent = %agent_id, %reason, "Agent blocked task");
                Turn::Block(reason)
            }
            AgentStep::ToolAction { tool, input } => {
                if self.tools.get(&tool).is_none() {
                    debug!(task_id = %task_id, tool = %tool, "Unknown tool requested");
                    Turn::Feedback(prompts::tool_missing(&tool))
                } else {
                    observer.notify(&WorkflowEvent::ToolStarted {
                        task_id: task_id.clone(),
                        agent_id: agent_id.clone(),
                        tool: tool.clone(),
                        input: input.clone(),
                    });
                    let result = tokio::select! {
                        biased;
                        reason = signal.cancelled() => return Err(Halt::Cancelled(reason)),
                        result = self.tools.execute(&tool, input, ctx.clone()) => result,
                    };
                    let result = result.unwrap_or_else(|e| ToolResult::error(e.to_string()));
                    observer.notify(&WorkflowEvent::ToolFinished {
                        task_id: task_id.clone(),
                        agent_id: agent_id.clone(),
                        tool: tool.clone(),
                        result: result.clone(),
                    });
                    if result.is_error {
                        Turn::Feedback(prompts::tool_error(&tool, &result.content))
                    } else {
                        Turn::Feedback(prompts::tool_result(&tool, &result.content))
                    }
                }
            }
            AgentStep::Observation { .. } => Turn::Feedback(prompts::observation()),
            AgentStep::Anomalous => {
                observer.notify(&WorkflowEvent::OutputRejected {
                    task_id: task_id.clone(),
                    agent_id: agent_id.clone(),
                    iteration,
                    unparsable: false,
                    output: raw.clone(),
                });
                Turn::Feedback(prompts::weird_output())
            }
        };
        Ok((raw, turn))
    }

    fn finish(&self, brief: &TaskBrief, observer: &dyn Observer, outcome: LoopOutcome) -> LoopOutcome {
        observer.notify(&WorkflowEvent::LoopFinished {
            task_id: brief.task_id.clone(),
            agent_id: self.profile.id.clone(),
            end: outcome.end(),
            iterations: outcome.iterations(),
            max_iterations: self.profile.max_iterations,
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use troupe_core::traits::NoopObserver;
    use troupe_test_utils::{
        final_answer, mock_model, wait_until, EchoTool, FailingLlm, FailingTool, GatedLlm,
        RecordingObserver, ScriptedLlm,
    };

    const THOUGHT: &str = r#"{"thought": "still thinking", "action": "self_question"}"#;

    fn brief() -> TaskBrief {
        TaskBrief {
            task_id: "t1".into(),
            description: "Summarize the findings".into(),
            expected_output: "A paragraph".into(),
            context: None,
            feedback: vec![],
            resume: false,
        }
    }

    fn agent_with(llm: Arc<dyn LlmClient>, profile: AgentProfile, tools: ToolRegistry) -> Agent {
        Agent::new(profile, mock_model(), llm, tools)
    }

    fn last_user(history: &[ChatMessage]) -> &str {
        history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn final_answer_on_first_iteration() {
        let llm = ScriptedLlm::new(vec![r#"{"finalAnswer": "42"}"#]);
        let agent = agent_with(Arc::new(llm), AgentProfile::new("a1", "Analyst"), ToolRegistry::new());
        let observer = RecordingObserver::new();

        let outcome = agent.work_on_task(&brief(), &CancelSignal::new(), &observer).await;
        assert_eq!(
            outcome,
            LoopOutcome::Finished {
                answer: "42".into(),
                iterations: 1,
                max_iterations: 10,
            }
        );
        let events = observer.events();
        assert!(matches!(events.first(), Some(WorkflowEvent::IterationStarted { iteration: 1, .. })));
        assert!(matches!(
            events.last(),
            Some(WorkflowEvent::LoopFinished { end: LoopEnd::FinalAnswer, iterations: 1, .. })
        ));
        assert_eq!(agent.held_iterations().await, 0);
    }

    #[tokio::test]
    async fn exhaustion_after_max_iterations() {
        let llm = ScriptedLlm::new(vec![THOUGHT]);
        let histories = llm.histories();
        let profile = AgentProfile::new("a1", "Analyst").with_max_iterations(3);
        let agent = agent_with(Arc::new(llm), profile, ToolRegistry::new());

        let outcome = agent.work_on_task(&brief(), &CancelSignal::new(), &NoopObserver).await;
        assert_eq!(
            outcome,
            LoopOutcome::Exhausted {
                iterations: 3,
                max_iterations: 3,
            }
        );

        let histories = histories.lock().unwrap();
        assert_eq!(histories.len(), 3);
        // After iteration 1, two iterations remain
        assert_eq!(last_user(&histories[1]), prompts::force_final_answer());
        assert_eq!(last_user(&histories[2]), prompts::thought("still thinking"));
    }

    #[tokio::test]
    async fn no_forced_answer_when_disabled() {
        let llm = ScriptedLlm::new(vec![THOUGHT]);
        let histories = llm.histories();
        let profile = AgentProfile::new("a1", "Analyst")
            .with_max_iterations(3)
            .with_force_final_answer(false);
        let agent = agent_with(Arc::new(llm), profile, ToolRegistry::new());
        agent.work_on_task(&brief(), &CancelSignal::new(), &NoopObserver).await;

        let histories = histories.lock().unwrap();
        assert!(histories
            .iter()
            .all(|h| last_user(h) != prompts::force_final_answer()));
    }

    #[tokio::test]
    async fn tool_results_feed_the_next_iteration() {
        let llm = ScriptedLlm::new(vec![
            r#"{"thought": "check", "action": "echo", "actionInput": {"q": "rust"}}"#,
            r#"{"thought": "retry", "action": "flaky", "actionInput": {}}"#,
            r#"{"thought": "guess", "action": "search", "actionInput": {}}"#,
            final_answer("done").as_str(),
        ]);
        let histories = llm.histories();
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(FailingTool);
        let agent = agent_with(Arc::new(llm), AgentProfile::new("a1", "Analyst"), tools);
        let observer = RecordingObserver::new();

        let outcome = agent.work_on_task(&brief(), &CancelSignal::new(), &observer).await;
        assert!(matches!(outcome, LoopOutcome::Finished { iterations: 4, .. }));

        let histories = histories.lock().unwrap();
        assert_eq!(last_user(&histories[1]), prompts::tool_result("echo", r#"{"q":"rust"}"#));
        assert!(last_user(&histories[2]).contains("An error occurred while using the tool flaky"));
        assert_eq!(last_user(&histories[3]), prompts::tool_missing("search"));

        let tool_runs = observer
            .events()
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::ToolFinished { .. }))
            .count();
        assert_eq!(tool_runs, 2);
    }

    #[tokio::test]
    async fn unparsable_output_gets_corrective_feedback() {
        let llm = ScriptedLlm::new(vec!["I think the answer is 42", final_answer("42").as_str()]);
        let histories = llm.histories();
        let agent = agent_with(Arc::new(llm), AgentProfile::new("a1", "Analyst"), ToolRegistry::new());
        let observer = RecordingObserver::new();

        let outcome = agent.work_on_task(&brief(), &CancelSignal::new(), &observer).await;
        assert!(matches!(outcome, LoopOutcome::Finished { iterations: 2, .. }));
        assert_eq!(last_user(&histories.lock().unwrap()[1]), prompts::invalid_json());
        assert!(observer
            .events()
            .iter()
            .any(|e| matches!(e, WorkflowEvent::OutputRejected { unparsable: true, .. })));
    }

    #[tokio::test]
    async fn llm_failure_ends_loop_immediately() {
        let llm = FailingLlm::new("HTTP 401: bad key");
        let agent = agent_with(Arc::new(llm), AgentProfile::new("a1", "Analyst"), ToolRegistry::new());
        let observer = RecordingObserver::new();

        let outcome = agent.work_on_task(&brief(), &CancelSignal::new(), &observer).await;
        match outcome {
            LoopOutcome::Failed { error, iterations, .. } => {
                assert!(error.contains("401"));
                assert_eq!(iterations, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(observer
            .events()
            .iter()
            .any(|e| matches!(e, WorkflowEvent::AgentError { .. })));
    }

    #[tokio::test]
    async fn block_task_requires_permission() {
        let block = r#"{"thought": "no data", "action": "block_task", "actionInput": {"reason": "missing dataset"}}"#;

        let allowed = agent_with(
            Arc::new(ScriptedLlm::new(vec![block])),
            AgentProfile::new("a1", "Analyst").with_blocking(true),
            ToolRegistry::new(),
        );
        let outcome = allowed.work_on_task(&brief(), &CancelSignal::new(), &NoopObserver).await;
        assert_eq!(
            outcome,
            LoopOutcome::Blocked {
                reason: "missing dataset".into(),
                iterations: 1,
                max_iterations: 10,
            }
        );

        let llm = ScriptedLlm::new(vec![block, final_answer("ok").as_str()]);
        let histories = llm.histories();
        let denied = agent_with(Arc::new(llm), AgentProfile::new("a1", "Analyst"), ToolRegistry::new());
        let outcome = denied.work_on_task(&brief(), &CancelSignal::new(), &NoopObserver).await;
        assert!(matches!(outcome, LoopOutcome::Finished { .. }));
        assert_eq!(last_user(&histories.lock().unwrap()[1]), prompts::tool_missing("block_task"));
    }

    #[tokio::test]
    async fn pause_keeps_state_for_resume() {
        let llm = GatedLlm::new(vec![THOUGHT, final_answer("resumed").as_str()]);
        let agent = Arc::new(agent_with(
            Arc::new(llm.clone()),
            AgentProfile::new("a1", "Analyst"),
            ToolRegistry::new(),
        ));
        llm.open(1);

        let signal = CancelSignal::new();
        let handle = {
            let agent = agent.clone();
            let signal = signal.clone();
            tokio::spawn(async move {
                let task = brief();
                agent.work_on_task(&task, &signal, &NoopObserver).await
            })
        };

        assert!(wait_until(|| llm.calls() == 2 && llm.waiting() == 1, Duration::from_secs(2)).await);
        signal.cancel(CancelReason::Paused);
        let outcome = handle.await.unwrap();
        assert_eq!(
            outcome,
            LoopOutcome::Interrupted {
                reason: CancelReason::Paused,
                iterations: 1,
                max_iterations: 10,
            }
        );
        assert_eq!(agent.held_iterations().await, 1);

        llm.open(1);
        let resumed = TaskBrief { resume: true, ..brief() };
        let outcome = agent.work_on_task(&resumed, &CancelSignal::new(), &NoopObserver).await;
        assert_eq!(
            outcome,
            LoopOutcome::Finished {
                answer: "resumed".into(),
                iterations: 2,
                max_iterations: 10,
            }
        );
    }

    #[tokio::test]
    async fn stop_clears_state() {
        let llm = GatedLlm::new(vec![THOUGHT]);
        let agent = agent_with(Arc::new(llm), AgentProfile::new("a1", "Analyst"), ToolRegistry::new());
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::Stopped);

        let outcome = agent.work_on_task(&brief(), &signal, &NoopObserver).await;
        assert!(matches!(
            outcome,
            LoopOutcome::Interrupted { reason: CancelReason::Stopped, iterations: 0, .. }
        ));
        assert_eq!(agent.held_iterations().await, 0);
    }

    #[tokio::test]
    async fn fork_has_independent_state() {
        let llm = GatedLlm::new(vec![THOUGHT]);
        let agent = agent_with(Arc::new(llm.clone()), AgentProfile::new("a1", "Analyst"), ToolRegistry::new());
        llm.open(1);

        let signal = CancelSignal::new();
        let task = brief();
        let paused = agent.work_on_task(&task, &signal, &NoopObserver);
        tokio::pin!(paused);
        // Drive until the second call parks, then pause
        let outcome = tokio::select! {
            outcome = &mut paused => outcome,
            _ = async {
                wait_until(|| llm.waiting() == 1, Duration::from_secs(2)).await;
                signal.cancel(CancelReason::Paused);
                std::future::pending::<()>().await
            } => unreachable!(),
        };
        assert!(matches!(outcome, LoopOutcome::Interrupted { iterations: 1, .. }));

        let fork = agent.fork();
        assert_eq!(agent.held_iterations().await, 1);
        assert_eq!(fork.held_iterations().await, 0);
        assert_eq!(fork.id(), "a1");
    }
}
