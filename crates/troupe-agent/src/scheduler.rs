//! Bounded-concurrency task scheduling over the execution graph.
//!
//! The scheduler is plain state: it decides what runs next and records
//! outcomes, emitting task status events as it goes. Spawning units and
//! the workflow-level lifecycle live in [`crate::workflow`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use troupe_core::cancel::{CancelReason, CancelSignal};
use troupe_core::config::ExecutionMode;
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::Observer;
use troupe_core::types::*;

use crate::agent_loop::{Agent, LoopOutcome, TaskBrief};
use crate::graph::{build_graphs, TaskGraph, WorkflowGraphs};
use crate::prompts::{interpolate, render_context};
use crate::run_log::WorkflowLog;

/// A task unit ready to be spawned.
pub struct Dispatch {
    pub index: usize,
    pub generation: u64,
    pub agent: Arc<Agent>,
    pub brief: TaskBrief,
    pub signal: CancelSignal,
}

struct InFlight {
    generation: u64,
    signal: CancelSignal,
    agent: Arc<Agent>,
}

#[derive(Debug, Clone, PartialEq)]
enum Failure {
    Errored(String),
    Blocked(String),
}

/// Where the run ends up once nothing is left to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Finished(Option<Value>),
    Errored(String),
    Blocked(String),
}

pub struct Scheduler {
    mode: ExecutionMode,
    concurrency: usize,
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    inputs: HashMap<String, Value>,
    graphs: Option<WorkflowGraphs>,
    /// Execution graph minus completed tasks.
    live: TaskGraph,
    queue: VecDeque<usize>,
    in_flight: HashMap<usize, InFlight>,
    /// Paused attempts, kept with the agent that holds their state.
    held: BTreeMap<usize, Arc<Agent>>,
    generations: Vec<u64>,
    failures: BTreeMap<usize, Failure>,
}

impl Scheduler {
    pub fn new(tasks: Vec<Task>, mode: ExecutionMode, concurrency: usize) -> Self {
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let generations = vec![0; tasks.len()];
        Self {
            mode,
            concurrency: concurrency.max(1),
            tasks,
            index,
            inputs: HashMap::new(),
            graphs: None,
            live: TaskGraph::default(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            held: BTreeMap::new(),
            generations,
            failures: BTreeMap::new(),
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn position(&self, task_id: &str) -> Result<usize> {
        self.index
            .get(task_id)
            .copied()
            .ok_or_else(|| TroupeError::TaskNotFound(task_id.to_string()))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Build both graphs and queue the entry nodes.
    ///
    /// On a graph error nothing changes.
    pub fn begin(&mut self, inputs: HashMap<String, Value>) -> Result<()> {
        let graphs = build_graphs(&self.tasks)?;
        self.live = graphs.execution.clone();
        self.graphs = Some(graphs);
        self.inputs = inputs;
        self.enqueue_ready();
        Ok(())
    }

    /// Pop ready work until the concurrency bound is reached.
    pub fn dispatch(
        &mut self,
        agents: &HashMap<String, Arc<Agent>>,
        log: &WorkflowLog,
        observer: &dyn Observer,
    ) -> Vec<Dispatch> {
        let mut units = Vec::new();
        while self.in_flight.len() < self.concurrency {
            let Some(index) = self.queue.pop_front() else {
                break;
            };
            if !self.launchable(index) {
                continue;
            }

            let (agent, resume) = match self.held.remove(&index) {
                Some(agent) => (agent, true),
                None => match self.pick_agent(index, agents) {
                    Some(agent) => (agent, false),
                    None => {
                        let agent_id = self.tasks[index].agent.clone();
                        self.fail(index, Failure::Errored(TroupeError::AgentNotFound(agent_id).to_string()), observer);
                        continue;
                    }
                },
            };

            if self.tasks[index].status != TaskStatus::Doing {
                self.set_status(index, TaskStatus::Doing, None, observer);
            }

            self.generations[index] += 1;
            let generation = self.generations[index];
            let signal = CancelSignal::new();
            let brief = self.brief(index, log, resume);
            self.in_flight.insert(
                index,
                InFlight {
                    generation,
                    signal: signal.clone(),
                    agent: agent.clone(),
                },
            );
            debug!(task_id = %brief.task_id, generation, resume, "Dispatching task");
            units.push(Dispatch {
                index,
                generation,
                agent,
                brief,
                signal,
            });
        }
        units
    }

    /// Record a unit's outcome. Returns false if the unit was stale.
    pub fn complete(
        &mut self,
        index: usize,
        generation: u64,
        outcome: LoopOutcome,
        observer: &dyn Observer,
    ) -> bool {
        let current = self.in_flight.get(&index).map(|f| f.generation);
        if current != Some(generation) {
            debug!(task_id = %self.tasks[index].id, generation, "Discarding stale task outcome");
            return false;
        }
        let Some(flight) = self.in_flight.remove(&index) else {
            return false;
        };

        let task_id = self.tasks[index].id.clone();
        match outcome {
            LoopOutcome::Finished { answer, .. } => {
                let result = Value::String(answer);
                let task = &mut self.tasks[index];
                task.result = Some(result.clone());
                for feedback in &mut task.feedback_history {
                    feedback.status = FeedbackStatus::Processed;
                }
                if task.external_validation_required {
                    self.set_status(index, TaskStatus::AwaitingValidation, Some(result), observer);
                } else {
                    self.set_status(index, TaskStatus::Done, Some(result), observer);
                    self.live.remove(index);
                    self.enqueue_ready();
                }
            }
            LoopOutcome::Exhausted {
                iterations,
                max_iterations,
            } => {
                let error = TroupeError::MaxIterationsExceeded {
                    iterations,
                    max_iterations,
                };
                self.fail(index, Failure::Blocked(format!("Task '{task_id}': {error}")), observer);
            }
            LoopOutcome::Blocked { reason, .. } => {
                let error = TroupeError::TaskBlocked {
                    task: task_id,
                    reason,
                };
                self.fail(index, Failure::Blocked(error.to_string()), observer);
            }
            LoopOutcome::Failed { error, .. } => {
                self.fail(
                    index,
                    Failure::Errored(format!("Task '{task_id}' failed: {error}")),
                    observer,
                );
            }
            LoopOutcome::Interrupted { reason, .. } => match reason {
                CancelReason::Paused => {
                    self.held.insert(index, flight.agent);
                }
                CancelReason::Revised | CancelReason::Stopped => {
                    self.set_status(index, TaskStatus::Todo, None, observer);
                    self.enqueue_ready();
                }
            },
        }
        true
    }

    /// Cancel in-flight units non-destructively and hold their state.
    pub fn pause(&mut self) {
        for (index, flight) in self.in_flight.drain() {
            flight.signal.cancel(CancelReason::Paused);
            self.held.insert(index, flight.agent);
        }
    }

    /// Put held attempts back at the front of the queue.
    pub fn resume(&mut self) {
        let held: Vec<usize> = self.held.keys().copied().collect();
        for &index in held.iter().rev() {
            self.queue.retain(|&q| q != index);
            self.queue.push_front(index);
        }
        self.enqueue_ready();
    }

    /// Cancel everything and revert DOING tasks to TODO.
    ///
    /// Returns the agents whose state must be cleared.
    pub fn stop(&mut self, observer: &dyn Observer) -> Vec<Arc<Agent>> {
        self.queue.clear();
        let mut agents = Vec::new();
        for (_, flight) in self.in_flight.drain() {
            flight.signal.cancel(CancelReason::Stopped);
            agents.push(flight.agent);
        }
        agents.extend(std::mem::take(&mut self.held).into_values());

        for index in 0..self.tasks.len() {
            if self.tasks[index].status == TaskStatus::Doing {
                self.set_status(index, TaskStatus::Todo, None, observer);
            }
        }
        agents
    }

    /// Attach feedback to a task and send it back through the queue.
    ///
    /// Tasks whose context depends on it (every later task in sequential
    /// mode) are cancelled if running and reset to TODO.
    pub fn revise(&mut self, index: usize, content: &str, observer: &dyn Observer) {
        self.tasks[index]
            .feedback_history
            .push(Feedback::new(content));

        let dependents: Vec<usize> = match (self.mode, &self.graphs) {
            (ExecutionMode::Sequential, _) => (index + 1..self.tasks.len()).collect(),
            (ExecutionMode::Graph, Some(graphs)) => graphs.context.descendants(index).into_iter().collect(),
            (ExecutionMode::Graph, None) => Vec::new(),
        };

        for &i in std::iter::once(&index).chain(&dependents) {
            if let Some(flight) = self.in_flight.remove(&i) {
                flight.signal.cancel(CancelReason::Revised);
            }
            self.held.remove(&i);
            self.failures.remove(&i);
            self.tasks[i].result = None;
        }

        info!(
            task_id = %self.tasks[index].id,
            reset = dependents.len(),
            "Task sent back for revision"
        );
        self.set_status(index, TaskStatus::Revise, None, observer);
        for &i in &dependents {
            if self.tasks[i].status != TaskStatus::Todo {
                self.set_status(i, TaskStatus::Todo, None, observer);
            }
        }

        if let Some(graphs) = &self.graphs {
            let tasks = &self.tasks;
            self.live = graphs
                .execution
                .restricted(|n| !tasks[n].status.is_complete());
        }
        self.queue
            .retain(|q| *q != index && !dependents.contains(q));
        self.queue.push_front(index);
        self.enqueue_ready();
    }

    /// AWAITING_VALIDATION -> VALIDATED, releasing dependents.
    pub fn validate(&mut self, index: usize, observer: &dyn Observer) -> Result<()> {
        let task = &self.tasks[index];
        if task.status != TaskStatus::AwaitingValidation {
            return Err(TroupeError::InvalidTaskState {
                action: "validate",
                task: task.id.clone(),
                status: task.status,
            });
        }
        let result = task.result.clone();
        self.set_status(index, TaskStatus::Validated, result, observer);
        self.live.remove(index);
        self.enqueue_ready();
        Ok(())
    }

    /// Final state of the run, once nothing is running or dispatchable.
    ///
    /// `None` while work remains or a task awaits validation.
    pub fn settlement(&self) -> Option<Settlement> {
        if !self.in_flight.is_empty() || self.queue.iter().any(|&i| self.launchable(i)) {
            return None;
        }
        if self.tasks.iter().all(|t| t.status.is_complete()) {
            return Some(Settlement::Finished(self.final_result()));
        }
        if self
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::AwaitingValidation)
        {
            return None;
        }
        let errored = self.failures.values().find_map(|f| match f {
            Failure::Errored(msg) => Some(msg.clone()),
            Failure::Blocked(_) => None,
        });
        if let Some(msg) = errored {
            return Some(Settlement::Errored(msg));
        }
        let blocked = self.failures.values().find_map(|f| match f {
            Failure::Blocked(msg) => Some(msg.clone()),
            Failure::Errored(_) => None,
        });
        Some(Settlement::Blocked(
            blocked.unwrap_or_else(|| "No runnable tasks remain".to_string()),
        ))
    }

    /// Deliverable task's result, else the last declared task's.
    pub fn final_result(&self) -> Option<Value> {
        self.tasks
            .iter()
            .find(|t| t.is_deliverable)
            .or_else(|| self.tasks.last())
            .and_then(|t| t.result.clone())
    }

    fn launchable(&self, index: usize) -> bool {
        let status = self.tasks[index].status;
        let ready = status.is_runnable() || (status == TaskStatus::Doing && self.held.contains_key(&index));
        ready && !self.in_flight.contains_key(&index) && self.live.is_entry(index)
    }

    fn enqueue_ready(&mut self) {
        for index in self.live.entry_nodes() {
            if self.tasks[index].status.is_runnable()
                && !self.queue.contains(&index)
                && !self.in_flight.contains_key(&index)
            {
                self.queue.push_back(index);
            }
        }
    }

    /// The task's agent, or a fork of it when the agent is already busy.
    fn pick_agent(&self, index: usize, agents: &HashMap<String, Arc<Agent>>) -> Option<Arc<Agent>> {
        let base = agents.get(&self.tasks[index].agent)?;
        let busy = self.in_flight.values().any(|f| Arc::ptr_eq(&f.agent, base))
            || self.held.values().any(|a| Arc::ptr_eq(a, base));
        if busy {
            info!(
                task_id = %self.tasks[index].id,
                agent = %base.id(),
                "Agent busy, running task on a fork"
            );
            Some(Arc::new(base.fork()))
        } else {
            Some(base.clone())
        }
    }

    fn brief(&self, index: usize, log: &WorkflowLog, resume: bool) -> TaskBrief {
        let task = &self.tasks[index];
        let context = self.graphs.as_ref().and_then(|graphs| {
            let results: Vec<(String, Value)> = graphs
                .context
                .ancestors(index)
                .into_iter()
                .filter(|&a| self.tasks[a].status.is_complete())
                .filter_map(|a| {
                    log.latest_result(&self.tasks[a].id)
                        .map(|r| (self.tasks[a].title.clone(), r))
                })
                .collect();
            render_context(&results)
        });
        TaskBrief {
            task_id: task.id.clone(),
            description: interpolate(&task.description, &self.inputs),
            expected_output: interpolate(&task.expected_output, &self.inputs),
            context,
            feedback: task
                .pending_feedback()
                .into_iter()
                .map(String::from)
                .collect(),
            resume,
        }
    }

    fn fail(&mut self, index: usize, failure: Failure, observer: &dyn Observer) {
        match &failure {
            Failure::Errored(msg) => warn!(task_id = %self.tasks[index].id, error = %msg, "Task errored"),
            Failure::Blocked(msg) => warn!(task_id = %self.tasks[index].id, reason = %msg, "Task blocked"),
        }
        self.set_status(index, TaskStatus::Blocked, None, observer);
        self.failures.insert(index, failure);
    }

    fn set_status(
        &mut self,
        index: usize,
        to: TaskStatus,
        result: Option<Value>,
        observer: &dyn Observer,
    ) {
        let task = &mut self.tasks[index];
        let from = task.status;
        task.status = to;
        debug!(task_id = %task.id, %from, %to, "Task status changed");
        observer.notify(&WorkflowEvent::TaskStatusChanged {
            task_id: task.id.clone(),
            agent_id: task.agent.clone(),
            from,
            to,
            result,
        });
    }
}
