//! Task DAGs over declaration indices.

pub mod builder;

use std::collections::BTreeSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

pub use builder::{build_graphs, WorkflowGraphs};

/// Directed graph whose nodes are task indices in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    graph: DiGraphMap<usize, ()>,
}

impl TaskGraph {
    /// Graph with nodes `0..count` and no edges.
    pub fn with_nodes(count: usize) -> Self {
        let mut graph = DiGraphMap::with_capacity(count, 0);
        for i in 0..count {
            graph.add_node(i);
        }
        Self { graph }
    }

    pub fn add_edge(&mut self, from: usize, to: usize) {
        self.graph.add_edge(from, to, ());
    }

    pub fn contains(&self, node: usize) -> bool {
        self.graph.contains_node(node)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Remove a node and its edges. Returns whether it was present.
    pub fn remove(&mut self, node: usize) -> bool {
        self.graph.remove_node(node)
    }

    /// Nodes with no remaining predecessor, ascending.
    pub fn entry_nodes(&self) -> Vec<usize> {
        let mut entries: Vec<usize> = self
            .graph
            .nodes()
            .filter(|&n| self.is_entry(n))
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn is_entry(&self, node: usize) -> bool {
        self.contains(node)
            && self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .next()
                .is_none()
    }

    pub fn predecessors(&self, node: usize) -> Vec<usize> {
        let mut preds: Vec<usize> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        preds.sort_unstable();
        preds
    }

    /// All transitive predecessors of `node`.
    pub fn ancestors(&self, node: usize) -> BTreeSet<usize> {
        self.reachable(node, Direction::Incoming)
    }

    /// All transitive successors of `node`.
    pub fn descendants(&self, node: usize) -> BTreeSet<usize> {
        self.reachable(node, Direction::Outgoing)
    }

    fn reachable(&self, node: usize, direction: Direction) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        if !self.contains(node) {
            return seen;
        }
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            for next in self.graph.neighbors_directed(current, direction) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Topological order; on a cycle, returns a node on it.
    pub fn toposort(&self) -> std::result::Result<Vec<usize>, usize> {
        toposort(&self.graph, None).map_err(|cycle| cycle.node_id())
    }

    /// Group nodes into levels: each level depends only on earlier ones.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut remaining = self.clone();
        let mut levels = Vec::new();
        while remaining.node_count() > 0 {
            let level = remaining.entry_nodes();
            if level.is_empty() {
                break;
            }
            for &node in &level {
                remaining.remove(node);
            }
            levels.push(level);
        }
        levels
    }

    /// Copy keeping only the nodes `keep` accepts, with the edges between them.
    pub fn restricted(&self, keep: impl Fn(usize) -> bool) -> Self {
        let mut graph = DiGraphMap::new();
        for node in self.graph.nodes().filter(|&n| keep(n)) {
            graph.add_node(node);
        }
        for (from, to, _) in self.graph.all_edges() {
            if graph.contains_node(from) && graph.contains_node(to) {
                graph.add_edge(from, to, ());
            }
        }
        Self { graph }
    }

    /// Edges sorted by (from, to).
    pub fn edges(&self) -> Vec<(usize, usize)> {
        let mut edges: Vec<(usize, usize)> =
            self.graph.all_edges().map(|(from, to, _)| (from, to)).collect();
        edges.sort_unstable();
        edges
    }
}
