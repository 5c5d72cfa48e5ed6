use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TroupeError};
use crate::types::Task;

/// Top-level workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub workflow: WorkflowSettings,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    /// Values substituted for `{name}` placeholders in task text.
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
}

/// How the scheduler orders tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One task at a time, shared linear context.
    #[default]
    Sequential,
    /// Dependency-driven with bounded concurrency.
    Graph,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default = "default_workflow_name")]
    pub name: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            name: default_workflow_name(),
            mode: ExecutionMode::default(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl WorkflowSettings {
    /// Concurrency actually used by the scheduler.
    pub fn effective_concurrency(&self) -> usize {
        match self.mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Graph => self.max_concurrency.max(1),
        }
    }
}

fn default_workflow_name() -> String { "workflow".to_string() }
fn default_max_concurrency() -> usize { 5 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            extra_headers: HashMap::new(),
            retry: None,
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub background: String,
    /// Key into `[models]`.
    #[serde(default = "default_model_key")]
    pub model: String,
    /// Tool names bound to this agent.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_force_final_answer")]
    pub force_final_answer: bool,
    /// Let the agent end a task with the `block_task` action.
    #[serde(default)]
    pub allow_blocking: bool,
}

fn default_model_key() -> String { "default".to_string() }
fn default_max_iterations() -> usize { 10 }
fn default_force_final_answer() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    pub agent: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub allow_parallel_execution: bool,
    #[serde(default)]
    pub is_deliverable: bool,
    #[serde(default)]
    pub external_validation_required: bool,
}

impl TaskConfig {
    pub fn to_task(&self) -> Task {
        let mut task = Task::new(&self.id, &self.description, &self.agent)
            .with_expected_output(&self.expected_output)
            .with_dependencies(self.dependencies.clone())
            .parallel(self.allow_parallel_execution);
        if let Some(title) = &self.title {
            task = task.with_title(title);
        }
        task.is_deliverable = self.is_deliverable;
        task.external_validation_required = self.external_validation_required;
        task
    }
}

impl WorkflowConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TroupeError::ConfigNotFound(path.display().to_string()))?;
        let config = Self::parse(&content)?;
        debug!(
            path = %path.display(),
            agents = config.agents.len(),
            tasks = config.tasks.len(),
            "Loaded workflow config"
        );
        Ok(config)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| TroupeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references between sections.
    pub fn validate(&self) -> Result<()> {
        if self.workflow.max_concurrency == 0 {
            return Err(TroupeError::Config(
                "workflow.max_concurrency must be at least 1".into(),
            ));
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(TroupeError::Config(format!(
                    "Duplicate agent id '{}'",
                    agent.id
                )));
            }
            if !self.models.contains_key(&agent.model) {
                return Err(TroupeError::Config(format!(
                    "Agent '{}' uses undefined model '{}'",
                    agent.id, agent.model
                )));
            }
            if agent.max_iterations == 0 {
                return Err(TroupeError::Config(format!(
                    "Agent '{}' must allow at least one iteration",
                    agent.id
                )));
            }
        }

        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id.as_str()) {
                return Err(TroupeError::Config(format!(
                    "Duplicate task id '{}'",
                    task.id
                )));
            }
            if !agent_ids.contains(task.agent.as_str()) {
                return Err(TroupeError::Config(format!(
                    "Task '{}' is assigned to undefined agent '{}'",
                    task.id, task.agent
                )));
            }
        }
        Ok(())
    }

    /// Tasks in declaration order, status TODO.
    pub fn build_tasks(&self) -> Vec<Task> {
        self.tasks.iter().map(TaskConfig::to_task).collect()
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    warn!(var = %var_name, "Environment variable not set, keeping placeholder");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
