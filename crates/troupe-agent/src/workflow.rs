//! Workflow lifecycle: start, pause, resume, stop, and the feedback and
//! validation entry points, on top of the [`Scheduler`].

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use troupe_core::config::{ExecutionMode, WorkflowConfig, WorkflowSettings};
use troupe_core::error::{Result, TroupeError};
use troupe_core::event::EventBus;
use troupe_core::traits::Observer;
use troupe_core::types::*;
use troupe_llm::ProviderRegistry;

use crate::agent_loop::{Agent, LoopOutcome};
use crate::run_log::{LogEntry, WorkflowLog};
use crate::scheduler::{Dispatch, Scheduler, Settlement};
use crate::stats;
use crate::tools::ToolRegistry;

struct Runtime {
    status: WorkflowStatus,
    scheduler: Scheduler,
    error: Option<String>,
}

struct Shared {
    run_id: RunId,
    name: String,
    agents: HashMap<String, Arc<Agent>>,
    base_inputs: HashMap<String, Value>,
    state: Mutex<Runtime>,
    log: WorkflowLog,
    bus: Arc<EventBus>,
    observers: Vec<Arc<dyn Observer>>,
    terminal: watch::Sender<Option<WorkflowResult>>,
    /// Events and results waiting to reach observers, in log order.
    outbox: Mutex<Vec<Outgoing>>,
    /// Held by whichever thread is draining the outbox.
    delivery: Mutex<()>,
}

enum Outgoing {
    Event(WorkflowEvent),
    Settled(WorkflowResult),
}

/// Agent loop events arrive without the state lock held and go out at once.
impl Observer for Shared {
    fn notify(&self, event: &WorkflowEvent) {
        self.log.append(event.clone(), None);
        self.enqueue(Outgoing::Event(event.clone()));
        self.flush();
    }
}

/// Observer handed to the scheduler while the state lock is held.
///
/// Events are logged immediately and delivered once the lock is released,
/// so observers are free to query the workflow.
struct Queued<'a>(&'a Shared);

impl Observer for Queued<'_> {
    fn notify(&self, event: &WorkflowEvent) {
        self.0.log.append(event.clone(), None);
        self.0.enqueue(Outgoing::Event(event.clone()));
    }
}

/// State guard that delivers queued events after unlocking.
struct Locked<'a> {
    guard: MutexGuard<'a, Runtime>,
    _flush: Flush<'a>,
}

struct Flush<'a>(&'a Shared);

impl Drop for Flush<'_> {
    fn drop(&mut self) {
        self.0.flush();
    }
}

impl Deref for Locked<'_> {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.guard
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut Runtime {
        &mut self.guard
    }
}

impl Shared {
    fn lock(&self) -> Locked<'_> {
        Locked {
            guard: self.state.lock().unwrap_or_else(|e| e.into_inner()),
            _flush: Flush(self),
        }
    }

    fn queued(&self) -> Queued<'_> {
        Queued(self)
    }

    fn enqueue(&self, item: Outgoing) {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(item);
    }

    /// Deliver queued items unless another thread already is.
    ///
    /// Never called with the state lock held.
    fn flush(&self) {
        loop {
            {
                let _delivering = match self.delivery.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::Poisoned(e)) => e.into_inner(),
                    Err(TryLockError::WouldBlock) => return,
                };
                loop {
                    let batch = std::mem::take(&mut *self.outbox.lock().unwrap_or_else(|e| e.into_inner()));
                    if batch.is_empty() {
                        break;
                    }
                    for item in batch {
                        self.deliver(item);
                    }
                }
            }
            // Items queued while another thread was bounced off the delivery lock.
            if self.outbox.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, item: Outgoing) {
        match item {
            Outgoing::Event(event) => {
                self.bus.publish(event.clone());
                for observer in &self.observers {
                    observer.notify(&event);
                }
            }
            Outgoing::Settled(result) => {
                self.terminal.send_replace(Some(result));
            }
        }
    }

    /// Move the workflow to `to`, logging the change with a stats snapshot.
    ///
    /// Terminal statuses settle every `start`/`wait` caller.
    fn transition(&self, rt: &mut Runtime, to: WorkflowStatus) {
        let from = rt.status;
        rt.status = to;
        let snapshot = stats::compute(&self.log.snapshot(), rt.scheduler.tasks().len());
        let event = WorkflowEvent::WorkflowStatusChanged { from, to };
        self.log.append(event.clone(), Some(snapshot.clone()));
        self.enqueue(Outgoing::Event(event));
        info!(workflow = %self.name, run_id = %self.run_id, %from, %to, "Workflow status changed");

        if to.is_terminal() {
            let result = match to {
                WorkflowStatus::Finished => rt.scheduler.final_result(),
                _ => None,
            };
            self.enqueue(Outgoing::Settled(WorkflowResult {
                status: to,
                result,
                stats: snapshot,
            }));
        }
    }

    /// Dispatch ready work and settle the run once nothing is left.
    fn advance(self: &Arc<Self>, rt: &mut Runtime) {
        if rt.status != WorkflowStatus::Running {
            return;
        }
        let units = rt.scheduler.dispatch(&self.agents, &self.log, &self.queued());
        for unit in units {
            self.spawn_unit(unit);
        }

        match rt.scheduler.settlement() {
            None => {}
            Some(Settlement::Finished(_)) => self.transition(rt, WorkflowStatus::Finished),
            Some(Settlement::Blocked(reason)) => {
                warn!(workflow = %self.name, %reason, "Workflow blocked");
                rt.error = Some(reason);
                self.transition(rt, WorkflowStatus::Blocked);
            }
            Some(Settlement::Errored(error)) => {
                warn!(workflow = %self.name, %error, "Workflow errored");
                rt.error = Some(error);
                self.transition(rt, WorkflowStatus::Errored);
            }
        }
    }

    fn spawn_unit(self: &Arc<Self>, unit: Dispatch) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let Dispatch {
                index,
                generation,
                agent,
                brief,
                signal,
            } = unit;
            let outcome = agent.work_on_task(&brief, &signal, &*shared).await;
            shared.unit_finished(index, generation, outcome);
        });
    }

    fn unit_finished(self: &Arc<Self>, index: usize, generation: u64, outcome: LoopOutcome) {
        let mut rt = self.lock();
        if !rt.scheduler.complete(index, generation, outcome, &self.queued()) {
            debug!(workflow = %self.name, index, generation, "Ignored outcome of a superseded attempt");
            return;
        }
        self.advance(&mut rt);
    }
}

/// A set of agents working through a task graph.
///
/// Cloning gives another handle to the same run.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<Shared>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Build agents and tasks from a parsed workflow file.
    pub fn from_config(
        config: &WorkflowConfig,
        providers: &ProviderRegistry,
        tools: &ToolRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let mut builder = WorkflowBuilder::new(config.workflow.name.clone())
            .mode(config.workflow.mode)
            .max_concurrency(config.workflow.max_concurrency)
            .inputs(config.inputs.clone());
        for agent in &config.agents {
            builder = builder.agent(Agent::from_config(agent, &config.models, providers, tools)?);
        }
        for task in config.build_tasks() {
            builder = builder.task(task);
        }
        builder.build()
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Subscribe to every event of this run.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.inner.bus.subscribe()
    }

    /// Build the task graphs, start scheduling, and wait for a terminal status.
    ///
    /// Inputs given here override the configured ones. Resolves with
    /// FINISHED, BLOCKED or STOPPED; ERRORED is returned as an error.
    pub async fn start(&self, inputs: HashMap<String, Value>) -> Result<WorkflowResult> {
        {
            let mut rt = self.inner.lock();
            if rt.status != WorkflowStatus::Initial {
                return Err(TroupeError::StateTransition {
                    action: "start",
                    status: rt.status,
                });
            }
            let mut merged = self.inner.base_inputs.clone();
            merged.extend(inputs);
            rt.scheduler.begin(merged)?;
            info!(
                workflow = %self.inner.name,
                run_id = %self.inner.run_id,
                tasks = rt.scheduler.tasks().len(),
                concurrency = rt.scheduler.concurrency(),
                "Starting workflow"
            );
            self.inner.transition(&mut rt, WorkflowStatus::Running);
            self.inner.advance(&mut rt);
        }
        self.wait().await
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait(&self) -> Result<WorkflowResult> {
        let mut rx = self.inner.terminal.subscribe();
        let result = loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                break result;
            }
            if rx.changed().await.is_err() {
                return Err(TroupeError::WorkflowErrored("workflow dropped".into()));
            }
        };
        if result.status == WorkflowStatus::Errored {
            let error = self.inner.lock().error.clone().unwrap_or_default();
            return Err(TroupeError::WorkflowErrored(error));
        }
        Ok(result)
    }

    /// RUNNING -> PAUSED. In-flight attempts keep their reasoning state.
    pub async fn pause(&self) -> Result<()> {
        let mut rt = self.inner.lock();
        if rt.status != WorkflowStatus::Running {
            return Err(TroupeError::StateTransition {
                action: "pause",
                status: rt.status,
            });
        }
        rt.scheduler.pause();
        self.inner.transition(&mut rt, WorkflowStatus::Paused);
        Ok(())
    }

    /// PAUSED -> RESUMED -> RUNNING. Paused attempts continue first.
    pub async fn resume(&self) -> Result<()> {
        let mut rt = self.inner.lock();
        if rt.status != WorkflowStatus::Paused {
            return Err(TroupeError::StateTransition {
                action: "resume",
                status: rt.status,
            });
        }
        self.inner.transition(&mut rt, WorkflowStatus::Resumed);
        rt.scheduler.resume();
        self.inner.transition(&mut rt, WorkflowStatus::Running);
        self.inner.advance(&mut rt);
        Ok(())
    }

    /// RUNNING/PAUSED -> STOPPING -> STOPPED.
    ///
    /// Cancels everything, reverts DOING tasks to TODO and waits for the
    /// cancelled attempts to release their agents.
    pub async fn stop(&self) -> Result<()> {
        let agents = {
            let mut rt = self.inner.lock();
            if !matches!(rt.status, WorkflowStatus::Running | WorkflowStatus::Paused) {
                return Err(TroupeError::StateTransition {
                    action: "stop",
                    status: rt.status,
                });
            }
            self.inner.transition(&mut rt, WorkflowStatus::Stopping);
            rt.scheduler.stop(&self.inner.queued())
        };

        for agent in agents {
            agent.reset().await;
        }

        let mut rt = self.inner.lock();
        self.inner.transition(&mut rt, WorkflowStatus::Stopped);
        Ok(())
    }

    /// Attach feedback to a task, sending it back for revision.
    pub async fn provide_feedback(&self, task_id: &str, content: &str) -> Result<()> {
        let mut rt = self.inner.lock();
        if !matches!(rt.status, WorkflowStatus::Running | WorkflowStatus::Paused) {
            return Err(TroupeError::StateTransition {
                action: "revise",
                status: rt.status,
            });
        }
        let index = rt.scheduler.position(task_id)?;
        rt.scheduler.revise(index, content, &self.inner.queued());
        self.inner.advance(&mut rt);
        Ok(())
    }

    /// Accept the result of a task awaiting validation.
    pub async fn validate_task(&self, task_id: &str) -> Result<()> {
        let mut rt = self.inner.lock();
        if !matches!(rt.status, WorkflowStatus::Running | WorkflowStatus::Paused) {
            return Err(TroupeError::StateTransition {
                action: "validate",
                status: rt.status,
            });
        }
        let index = rt.scheduler.position(task_id)?;
        rt.scheduler.validate(index, &self.inner.queued())?;
        self.inner.advance(&mut rt);
        Ok(())
    }

    pub fn status(&self) -> WorkflowStatus {
        self.inner.lock().status
    }

    pub fn task_status(&self, task_id: &str) -> Result<TaskStatus> {
        let rt = self.inner.lock();
        let index = rt.scheduler.position(task_id)?;
        Ok(rt.scheduler.tasks()[index].status)
    }

    /// Snapshot of every task in declaration order.
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.lock().scheduler.tasks().to_vec()
    }

    pub fn stats(&self) -> WorkflowStats {
        let task_count = self.inner.lock().scheduler.tasks().len();
        stats::compute(&self.inner.log.snapshot(), task_count)
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.inner.log.snapshot()
    }

    pub fn log_jsonl(&self) -> Result<String> {
        Ok(self.inner.log.to_jsonl()?)
    }

    /// The terminal result, once there is one.
    pub fn result(&self) -> Option<WorkflowResult> {
        self.inner.terminal.borrow().clone()
    }
}

/// Builder for a [`Workflow`].
pub struct WorkflowBuilder {
    settings: WorkflowSettings,
    agents: Vec<Agent>,
    tasks: Vec<Task>,
    inputs: HashMap<String, Value>,
    observers: Vec<Arc<dyn Observer>>,
    bus: Option<Arc<EventBus>>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            settings: WorkflowSettings {
                name: name.into(),
                ..Default::default()
            },
            agents: vec![],
            tasks: vec![],
            inputs: HashMap::new(),
            observers: vec![],
            bus: None,
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.settings.mode = mode;
        self
    }

    /// Upper bound on concurrently running tasks in graph mode.
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.settings.max_concurrency = max;
        self
    }

    pub fn agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Publish events on an existing bus instead of a private one.
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<Workflow> {
        let mut agents = HashMap::new();
        for agent in self.agents {
            let id = agent.id().to_string();
            if agents.insert(id.clone(), Arc::new(agent)).is_some() {
                return Err(TroupeError::Config(format!("Duplicate agent id '{id}'")));
            }
        }

        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id.as_str()) {
                return Err(TroupeError::Config(format!("Duplicate task id '{}'", task.id)));
            }
            if !agents.contains_key(&task.agent) {
                return Err(TroupeError::AgentNotFound(task.agent.clone()));
            }
        }

        let concurrency = self.settings.effective_concurrency();
        let scheduler = Scheduler::new(self.tasks, self.settings.mode, concurrency);
        let (terminal, _) = watch::channel(None);

        Ok(Workflow {
            inner: Arc::new(Shared {
                run_id: RunId::new(),
                name: self.settings.name,
                agents,
                base_inputs: self.inputs,
                state: Mutex::new(Runtime {
                    status: WorkflowStatus::Initial,
                    scheduler,
                    error: None,
                }),
                log: WorkflowLog::new(),
                bus: self.bus.unwrap_or_default(),
                observers: self.observers,
                terminal,
                outbox: Mutex::new(Vec::new()),
                delivery: Mutex::new(()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use troupe_test_utils::{final_answer, mock_model, ScriptedLlm};

    use crate::agent_loop::AgentProfile;

    fn agent(id: &str, responses: Vec<&str>) -> Agent {
        Agent::new(
            AgentProfile::new(id, "Worker"),
            mock_model(),
            Arc::new(ScriptedLlm::new(responses)),
            ToolRegistry::new(),
        )
    }

    #[tokio::test]
    async fn single_task_finishes_with_its_result() {
        let answer = final_answer("42");
        let workflow = Workflow::builder("answer")
            .agent(agent("w1", vec![answer.as_str()]))
            .task(Task::new("t1", "Compute the answer", "w1"))
            .build()
            .unwrap();

        let result = workflow.start(HashMap::new()).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Finished);
        assert_eq!(result.result, Some(Value::String("42".into())));
        assert_eq!(workflow.task_status("t1").unwrap(), TaskStatus::Done);
        assert_eq!(workflow.result().unwrap().status, WorkflowStatus::Finished);
    }

    #[tokio::test]
    async fn transitions_carry_stats() {
        let answer = final_answer("ok");
        let workflow = Workflow::builder("stats")
            .agent(agent("w1", vec![answer.as_str()]))
            .task(Task::new("t1", "Do it", "w1"))
            .build()
            .unwrap();
        workflow.start(HashMap::new()).await.unwrap();

        let transitions: Vec<LogEntry> = workflow
            .log()
            .into_iter()
            .filter(|e| matches!(e.event, WorkflowEvent::WorkflowStatusChanged { .. }))
            .collect();
        assert_eq!(transitions.len(), 2);
        assert!(transitions.iter().all(|e| e.stats.is_some()));
        let last = transitions[1].stats.clone().unwrap();
        assert_eq!(last.llm_calls, 1);
        assert_eq!(last.tasks_completed, 1);
    }

    /// Reads the workflow back from inside every notification.
    struct StatusReader {
        workflow: std::sync::OnceLock<Workflow>,
        seen: Mutex<Vec<(WorkflowStatus, TaskStatus)>>,
    }

    impl Observer for StatusReader {
        fn notify(&self, event: &WorkflowEvent) {
            let (Some(workflow), WorkflowEvent::TaskStatusChanged { .. }) = (self.workflow.get(), event)
            else {
                return;
            };
            let task = workflow.task_status("t1").unwrap();
            assert_eq!(workflow.tasks().len(), 1);
            self.seen.lock().unwrap().push((workflow.status(), task));
        }
    }

    #[tokio::test]
    async fn observers_can_query_the_workflow() {
        let reader = Arc::new(StatusReader {
            workflow: std::sync::OnceLock::new(),
            seen: Mutex::new(Vec::new()),
        });
        let answer = final_answer("ok");
        let workflow = Workflow::builder("reentrant")
            .agent(agent("w1", vec![answer.as_str()]))
            .task(Task::new("t1", "Do it", "w1"))
            .observer(reader.clone())
            .build()
            .unwrap();
        reader.workflow.set(workflow.clone()).ok();

        let result = tokio::time::timeout(Duration::from_secs(5), workflow.start(HashMap::new()))
            .await
            .expect("start deadlocked")
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Finished);

        let seen = reader.seen.lock().unwrap().clone();
        assert_eq!(
            seen.last(),
            Some(&(WorkflowStatus::Finished, TaskStatus::Done))
        );
        assert!(seen.iter().any(|(_, task)| *task == TaskStatus::Doing || *task == TaskStatus::Done));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let answer = final_answer("ok");
        let workflow = Workflow::builder("twice")
            .agent(agent("w1", vec![answer.as_str()]))
            .task(Task::new("t1", "Do it", "w1"))
            .build()
            .unwrap();
        workflow.start(HashMap::new()).await.unwrap();
        let err = workflow.start(HashMap::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TroupeError::StateTransition {
                action: "start",
                status: WorkflowStatus::Finished
            }
        ));
    }

    #[tokio::test]
    async fn graph_cycle_blocks_start() {
        let workflow = Workflow::builder("cycle")
            .mode(ExecutionMode::Graph)
            .agent(agent("w1", vec![]))
            .task(Task::new("a", "A", "w1").parallel(true).with_dependencies(vec!["b".into()]))
            .task(Task::new("b", "B", "w1").parallel(true).with_dependencies(vec!["a".into()]))
            .build()
            .unwrap();
        let err = workflow.start(HashMap::new()).await.unwrap_err();
        assert!(matches!(err, TroupeError::GraphCycle { .. }));
        assert_eq!(workflow.status(), WorkflowStatus::Initial);
    }

    #[tokio::test]
    async fn pause_requires_running() {
        let workflow = Workflow::builder("idle")
            .agent(agent("w1", vec![]))
            .build()
            .unwrap();
        let err = workflow.pause().await.unwrap_err();
        assert!(matches!(err, TroupeError::StateTransition { action: "pause", .. }));
        assert!(workflow.resume().await.is_err());
        assert!(workflow.stop().await.is_err());
        assert_eq!(workflow.status(), WorkflowStatus::Initial);
    }

    #[tokio::test]
    async fn builder_rejects_unknown_agents_and_duplicates() {
        let err = Workflow::builder("bad")
            .task(Task::new("t1", "x", "ghost"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TroupeError::AgentNotFound(id) if id == "ghost"));

        let err = Workflow::builder("dup")
            .agent(agent("w1", vec![]))
            .task(Task::new("t1", "x", "w1"))
            .task(Task::new("t1", "y", "w1"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TroupeError::Config(_)));
    }

    #[tokio::test]
    async fn start_inputs_override_configured_inputs() {
        let llm = Arc::new(ScriptedLlm::new(vec![r#"{"finalAnswer": "done"}"#]));
        let histories = llm.histories();
        let workflow = Workflow::builder("inputs")
            .agent(Agent::new(
                AgentProfile::new("w1", "Writer"),
                mock_model(),
                llm,
                ToolRegistry::new(),
            ))
            .task(Task::new("t1", "Write about {topic} for {audience}", "w1"))
            .input("topic", "rivers")
            .input("audience", "kids")
            .build()
            .unwrap();

        let inputs = HashMap::from([("topic".to_string(), Value::from("glaciers"))]);
        tokio::time::timeout(Duration::from_secs(5), workflow.start(inputs))
            .await
            .unwrap()
            .unwrap();

        let histories = histories.lock().unwrap();
        let prompt: String = histories[0].iter().map(|m| m.content.clone()).collect();
        assert!(prompt.contains("Write about glaciers for kids"));
    }
}
