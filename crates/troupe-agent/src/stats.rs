//! Statistics derived from the workflow log.

use std::collections::HashMap;

use chrono::Utc;

use troupe_core::types::{TaskStatus, WorkflowEvent, WorkflowStats, WorkflowStatus};

use crate::run_log::LogEntry;

/// Aggregate `entries` into a stats snapshot for `task_count` tasks.
///
/// Duration runs from the first move to RUNNING until the first terminal
/// status, or until now if the run is still going.
pub fn compute(entries: &[LogEntry], task_count: usize) -> WorkflowStats {
    let mut stats = WorkflowStats {
        task_count,
        ..Default::default()
    };
    let mut latest: HashMap<&str, TaskStatus> = HashMap::new();
    let mut started = None;
    let mut ended = None;

    for entry in entries {
        match &entry.event {
            WorkflowEvent::WorkflowStatusChanged { to, .. } => {
                if *to == WorkflowStatus::Running && started.is_none() {
                    started = Some(entry.timestamp);
                }
                if to.is_terminal() && ended.is_none() {
                    ended = Some(entry.timestamp);
                }
            }
            WorkflowEvent::TaskStatusChanged { task_id, to, .. } => {
                latest.insert(task_id.as_str(), *to);
            }
            WorkflowEvent::IterationFinished { .. } => stats.iterations += 1,
            WorkflowEvent::ThinkingFinished { usage, .. } => {
                stats.llm_calls += 1;
                stats.input_tokens += usage.input_tokens;
                stats.output_tokens += usage.output_tokens;
            }
            WorkflowEvent::ToolFinished { .. } => stats.tool_calls += 1,
            WorkflowEvent::OutputRejected {
                unparsable: true, ..
            } => stats.parse_failures += 1,
            _ => {}
        }
    }

    stats.tasks_completed = latest.values().filter(|s| s.is_complete()).count();
    stats.tasks_blocked = latest
        .values()
        .filter(|s| **s == TaskStatus::Blocked)
        .count();

    if let Some(started) = started {
        let end = ended.unwrap_or_else(Utc::now);
        stats.duration_ms = (end - started).num_milliseconds().max(0) as u64;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_log::WorkflowLog;
    use troupe_core::types::TokenUsage;

    fn task_change(task: &str, to: TaskStatus) -> WorkflowEvent {
        WorkflowEvent::TaskStatusChanged {
            task_id: task.into(),
            agent_id: "a1".into(),
            from: TaskStatus::Doing,
            to,
            result: None,
        }
    }

    #[test]
    fn counts_loop_activity_and_task_states() {
        let log = WorkflowLog::new();
        log.append(
            WorkflowEvent::WorkflowStatusChanged {
                from: WorkflowStatus::Initial,
                to: WorkflowStatus::Running,
            },
            None,
        );
        for iteration in 1..=2 {
            log.append(
                WorkflowEvent::ThinkingFinished {
                    task_id: "t1".into(),
                    agent_id: "a1".into(),
                    iteration,
                    output: "{}".into(),
                    usage: TokenUsage {
                        input_tokens: 10,
                        output_tokens: 5,
                    },
                },
                None,
            );
            log.append(
                WorkflowEvent::IterationFinished {
                    task_id: "t1".into(),
                    agent_id: "a1".into(),
                    iteration,
                    max_iterations: 10,
                },
                None,
            );
        }
        log.append(
            WorkflowEvent::OutputRejected {
                task_id: "t1".into(),
                agent_id: "a1".into(),
                iteration: 1,
                unparsable: true,
                output: "oops".into(),
            },
            None,
        );
        log.append(task_change("t1", TaskStatus::Done), None);
        log.append(task_change("t2", TaskStatus::Done), None);
        log.append(task_change("t2", TaskStatus::Revise), None);
        log.append(task_change("t3", TaskStatus::Blocked), None);

        let stats = compute(&log.snapshot(), 3);
        assert_eq!(stats.task_count, 3);
        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.llm_calls, 2);
        assert_eq!(stats.input_tokens, 20);
        assert_eq!(stats.output_tokens, 10);
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.tasks_blocked, 1);
    }

    #[test]
    fn empty_log_is_all_zero() {
        let stats = compute(&[], 0);
        assert_eq!(stats, WorkflowStats::default());
    }
}
