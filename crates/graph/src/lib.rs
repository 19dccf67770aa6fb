//! Dependency graph over changes: kind precedence, declared references and
//! namespace containment, with delete edges running in reverse.

#![forbid(unsafe_code)]

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use berth_config::{KindOrderOverride, ReferenceRule};
use berth_diff::{Change, ChangeOp};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("circular dependency: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
}

/// Directed acyclic graph of change indexes. An edge `A -> B` means A must
/// reach Done before B may leave Pending.
#[derive(Debug)]
pub struct ChangeGraph {
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
}

impl ChangeGraph {
    pub fn build(
        changes: &[Change],
        reference_rules: &[ReferenceRule],
        order_overrides: &[KindOrderOverride],
    ) -> Result<ChangeGraph, GraphError> {
        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..changes.len()).map(|i| graph.add_node(i)).collect();
        let mut g = ChangeGraph { graph, nodes };

        g.add_kind_precedence_edges(changes, order_overrides);
        g.add_reference_edges(changes, reference_rules);
        g.add_namespace_edges(changes);

        g.ensure_acyclic(changes)?;
        Ok(g)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn predecessors(&self, idx: usize) -> Vec<usize> {
        self.graph
            .neighbors_directed(self.nodes[idx], Direction::Incoming)
            .map(|n| self.graph[n])
            .collect()
    }

    pub fn successors(&self, idx: usize) -> Vec<usize> {
        self.graph
            .neighbors_directed(self.nodes[idx], Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect()
    }

    /// All nodes reachable from `idx` following edges forward.
    pub fn transitive_successors(&self, idx: usize) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = self.successors(idx);
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            out.push(i);
            stack.extend(self.successors(i));
        }
        out
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        self.graph.update_edge(self.nodes[from], self.nodes[to], ());
    }

    // Edge direction for a dependency pair, honouring delete reversal: the
    // dependent is torn down before what it depends on.
    fn add_dependency(&mut self, changes: &[Change], depended_on: usize, dependent: usize) {
        let a_del = changes[depended_on].op() == ChangeOp::Delete;
        let b_del = changes[dependent].op() == ChangeOp::Delete;
        match (a_del, b_del) {
            (false, false) => self.add_edge(depended_on, dependent),
            (true, true) => self.add_edge(dependent, depended_on),
            // A mixed pair has no meaningful ordering between them.
            _ => {}
        }
    }

    fn add_kind_precedence_edges(&mut self, changes: &[Change], overrides: &[KindOrderOverride]) {
        for i in 0..changes.len() {
            for j in 0..changes.len() {
                if i == j {
                    continue;
                }
                let rank_i = kind_rank(changes[i].resource().kind(), overrides);
                let rank_j = kind_rank(changes[j].resource().kind(), overrides);
                if rank_i < rank_j {
                    self.add_dependency(changes, i, j);
                }
            }
        }
    }

    fn add_reference_edges(&mut self, changes: &[Change], rules: &[ReferenceRule]) {
        for (i, change) in changes.iter().enumerate() {
            let res = change.resource();
            for rule in rules {
                if res.kind() != rule.from_kind {
                    continue;
                }
                for value in res.collect(&rule.from_path) {
                    let name = match value.as_str() {
                        Some(s) => s,
                        None => continue,
                    };
                    // Absent referents are ignored, not errors.
                    if let Some(t) = find_target(changes, &rule.to_kind, name, res.namespace()) {
                        self.add_dependency(changes, t, i);
                    }
                }
            }
        }
    }

    fn add_namespace_edges(&mut self, changes: &[Change]) {
        for (i, ns_change) in changes.iter().enumerate() {
            if ns_change.resource().kind() != "Namespace" {
                continue;
            }
            let ns_name = ns_change.resource().name();
            for (j, contained) in changes.iter().enumerate() {
                if i == j {
                    continue;
                }
                if contained.resource().namespace() == Some(ns_name) {
                    self.add_dependency(changes, i, j);
                }
            }
        }
    }

    // Depth-first coloring; on a back edge the current stack names the cycle.
    fn ensure_acyclic(&self, changes: &[Change]) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        fn visit(
            g: &ChangeGraph,
            changes: &[Change],
            idx: usize,
            colors: &mut Vec<Color>,
            stack: &mut Vec<usize>,
        ) -> Result<(), GraphError> {
            colors[idx] = Color::Gray;
            stack.push(idx);
            for next in g.successors(idx) {
                match colors[next] {
                    Color::Black => {}
                    Color::White => visit(g, changes, next, colors, stack)?,
                    Color::Gray => {
                        let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&n| changes[n].resource().description())
                            .collect();
                        cycle.push(changes[next].resource().description());
                        return Err(GraphError::CircularDependency { cycle });
                    }
                }
            }
            stack.pop();
            colors[idx] = Color::Black;
            Ok(())
        }

        let mut colors = vec![Color::White; self.nodes.len()];
        let mut stack = Vec::new();
        for idx in 0..self.nodes.len() {
            if colors[idx] == Color::White {
                visit(self, changes, idx, &mut colors, &mut stack)?;
            }
        }
        Ok(())
    }
}

fn find_target(
    changes: &[Change],
    kind: &str,
    name: &str,
    namespace: Option<&str>,
) -> Option<usize> {
    changes.iter().position(|c| {
        let res = c.resource();
        res.kind() == kind
            && res.name() == name
            && (res.namespace().is_none() || res.namespace() == namespace)
    })
}

/// Fixed precedence among resource kinds; lower ranks are applied first.
/// Unknown kinds share a default rank and stay mutually unordered.
fn kind_rank(kind: &str, overrides: &[KindOrderOverride]) -> i32 {
    if let Some(o) = overrides.iter().find(|o| o.kind == kind) {
        return o.order;
    }
    match kind {
        "CustomResourceDefinition" => 10,
        "Namespace" => 20,
        "PriorityClass" | "StorageClass" => 25,
        "ServiceAccount" => 30,
        "ClusterRole" => 31,
        "ClusterRoleBinding" => 32,
        "Role" => 33,
        "RoleBinding" => 34,
        "ConfigMap" | "Secret" => 40,
        "PersistentVolume" => 45,
        "PersistentVolumeClaim" => 46,
        "LimitRange" | "ResourceQuota" | "NetworkPolicy" => 48,
        "Service" => 50,
        _ => 100,
    }
}
