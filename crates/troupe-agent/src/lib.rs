pub mod agent_loop;
pub mod graph;
pub mod parser;
pub mod prompts;
pub mod run_log;
pub mod scheduler;
pub mod stats;
pub mod tools;
pub mod workflow;

pub use agent_loop::{Agent, AgentProfile, LoopOutcome, TaskBrief};
pub use graph::{build_graphs, TaskGraph, WorkflowGraphs};
pub use parser::{classify, parse_output, AgentOutput, AgentStep};
pub use run_log::{LogEntry, WorkflowLog};
pub use tools::ToolRegistry;
pub use workflow::{Workflow, WorkflowBuilder};
