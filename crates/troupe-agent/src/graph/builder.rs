use std::collections::HashMap;

use tracing::warn;

use troupe_core::error::{Result, TroupeError};
use troupe_core::types::Task;

use super::TaskGraph;

/// The two DAGs built from a task list.
///
/// `execution` orders work; `context` decides whose results a task sees.
#[derive(Debug, Clone)]
pub struct WorkflowGraphs {
    pub execution: TaskGraph,
    pub context: TaskGraph,
}

/// Build both graphs from tasks in declaration order.
///
/// - explicit dependency `d` of task `t`: execution and context edge `d -> t`
/// - a task that does not allow parallel execution also gets an execution
///   edge from every task declared before it
/// - a task without explicit dependencies gets a context edge from the
///   nearest earlier task that does not allow parallel execution
///
/// Unknown dependency ids are dropped with a warning. A cycle in either
/// graph (including a task depending on itself) is an error.
pub fn build_graphs(tasks: &[Task]) -> Result<WorkflowGraphs> {
    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let mut execution = TaskGraph::with_nodes(tasks.len());
    let mut context = TaskGraph::with_nodes(tasks.len());

    for (i, task) in tasks.iter().enumerate() {
        let mut deps = Vec::new();
        for dep in &task.dependencies {
            match index.get(dep.as_str()) {
                Some(&d) if d == i => {
                    return Err(TroupeError::GraphCycle {
                        graph: "execution",
                        task: task.id.clone(),
                    });
                }
                Some(&d) => deps.push(d),
                None => {
                    warn!(task_id = %task.id, dependency = %dep, "Dropping unknown dependency");
                }
            }
        }

        for &d in &deps {
            execution.add_edge(d, i);
            context.add_edge(d, i);
        }

        if !task.allow_parallel_execution {
            for earlier in 0..i {
                execution.add_edge(earlier, i);
            }
        }

        if deps.is_empty() {
            if let Some(prev) = (0..i).rev().find(|&j| !tasks[j].allow_parallel_execution) {
                context.add_edge(prev, i);
            }
        }
    }

    for (name, graph) in [("execution", &execution), ("context", &context)] {
        if let Err(node) = graph.toposort() {
            return Err(TroupeError::GraphCycle {
                graph: name,
                task: tasks[node].id.clone(),
            });
        }
    }

    Ok(WorkflowGraphs { execution, context })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task::new(id, format!("do {id}"), "agent")
    }

    fn position(order: &[usize], node: usize) -> usize {
        order.iter().position(|&n| n == node).unwrap()
    }

    #[test]
    fn sequential_fallback_orders_by_declaration() {
        let tasks = vec![task("a"), task("b"), task("c")];
        let graphs = build_graphs(&tasks).unwrap();
        assert_eq!(graphs.execution.toposort().unwrap(), vec![0, 1, 2]);
        assert_eq!(graphs.execution.entry_nodes(), vec![0]);
        assert_eq!(graphs.context.edges(), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn explicit_dependencies_with_parallel_tasks() {
        let tasks = vec![
            task("a").parallel(true),
            task("b").parallel(true).with_dependencies(vec!["a".into()]),
            task("c").parallel(true),
        ];
        let graphs = build_graphs(&tasks).unwrap();
        assert_eq!(graphs.execution.edges(), vec![(0, 1)]);
        assert_eq!(graphs.execution.entry_nodes(), vec![0, 2]);
        assert_eq!(graphs.context.edges(), vec![(0, 1)]);
    }

    #[test]
    fn order_respects_dependencies_and_fallback() {
        let tasks = vec![
            task("fetch").parallel(true),
            task("clean").parallel(true).with_dependencies(vec!["fetch".into()]),
            task("chart").parallel(true).with_dependencies(vec!["clean".into()]),
            task("report"),
        ];
        let graphs = build_graphs(&tasks).unwrap();
        let order = graphs.execution.toposort().unwrap();
        assert!(position(&order, 0) < position(&order, 1));
        assert!(position(&order, 1) < position(&order, 2));
        assert_eq!(position(&order, 3), 3);
        // "report" has no explicit deps and nothing non-parallel before it
        assert!(graphs.context.predecessors(3).is_empty());
    }

    #[test]
    fn context_chains_from_nearest_sequential_task() {
        let tasks = vec![task("plan"), task("left").parallel(true), task("right").parallel(true)];
        let graphs = build_graphs(&tasks).unwrap();
        assert_eq!(graphs.context.edges(), vec![(0, 1), (0, 2)]);
        // Parallel siblings see the common ancestor without ordering between them
        assert_eq!(graphs.execution.entry_nodes(), vec![0]);
        assert!(!graphs.execution.edges().contains(&(1, 2)));
    }

    #[test]
    fn unknown_dependency_is_dropped() {
        let tasks = vec![task("a").parallel(true).with_dependencies(vec!["ghost".into()])];
        let graphs = build_graphs(&tasks).unwrap();
        assert_eq!(graphs.execution.entry_nodes(), vec![0]);
    }

    #[test]
    fn cycles_fail_construction() {
        let tasks = vec![
            task("a").parallel(true).with_dependencies(vec!["b".into()]),
            task("b").parallel(true).with_dependencies(vec!["a".into()]),
        ];
        let err = build_graphs(&tasks).unwrap_err();
        assert!(matches!(err, TroupeError::GraphCycle { graph: "execution", .. }));

        // Forward dependency against the sequential fallback
        let tasks = vec![task("a").with_dependencies(vec!["b".into()]), task("b")];
        assert!(build_graphs(&tasks).is_err());

        let tasks = vec![task("a").with_dependencies(vec!["a".into()])];
        let err = build_graphs(&tasks).unwrap_err();
        assert!(matches!(err, TroupeError::GraphCycle { task, .. } if task == "a"));
    }
}
