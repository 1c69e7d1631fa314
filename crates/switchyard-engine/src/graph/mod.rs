//! Workflow graph: nodes, condition-gated edges, and the validating builder.
//!
//! A `Graph` is immutable once built and is shared between concurrent runs
//! behind an `Arc`. Terminal nodes are structural sinks (no outgoing edges).

pub mod builder;
pub mod edge;
pub mod node;
pub mod snapshot;
mod validate;

use std::collections::HashMap;

pub use builder::GraphBuilder;
pub use edge::Edge;
pub use node::{InputContract, NodeSpec};
pub use snapshot::{EdgeSnapshot, GraphSnapshot, NodeSnapshot};

/// A validated, acyclic workflow graph.
pub struct Graph {
    name: String,
    nodes: Vec<NodeSpec>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    ends: Vec<(usize, usize)>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    start: usize,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> &NodeSpec {
        &self.nodes[self.start]
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// Edges in registration order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn outgoing(&self, name: &str) -> Vec<&Edge> {
        self.index
            .get(name)
            .map(|&i| self.outgoing[i].iter().map(|&e| &self.edges[e]).collect())
            .unwrap_or_default()
    }

    pub fn incoming(&self, name: &str) -> Vec<&Edge> {
        self.index
            .get(name)
            .map(|&i| self.incoming[i].iter().map(|&e| &self.edges[e]).collect())
            .unwrap_or_default()
    }

    /// Whether `name` is a node without outgoing edges.
    pub fn is_terminal(&self, name: &str) -> bool {
        self.index
            .get(name)
            .is_some_and(|&i| self.outgoing[i].is_empty())
    }

    /// Terminal node names in registration order.
    pub fn terminals(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| self.outgoing[*i].is_empty())
            .map(|(_, n)| n.name.as_str())
            .collect()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            name: self.name.clone(),
            start: self.start().name.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeSnapshot {
                    name: n.name.clone(),
                    kind: n.kind().to_string(),
                    merge_inputs: n.inputs.sources().to_vec(),
                    description: n.description.clone(),
                    output_schema: n.output_schema.clone(),
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|e| EdgeSnapshot {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    condition: e.condition_name().map(str::to_string),
                    fallback: e.condition.as_ref().map(|c| c.fallback()),
                })
                .collect(),
            terminals: self.terminals().into_iter().map(str::to_string).collect(),
        }
    }

    // Index-based access for the scheduler.

    pub(crate) fn start_index(&self) -> usize {
        self.start
    }

    pub(crate) fn node_at(&self, idx: usize) -> &NodeSpec {
        &self.nodes[idx]
    }

    /// `(edge, target index)` for each outgoing edge of `idx`.
    pub(crate) fn outgoing_at(&self, idx: usize) -> impl Iterator<Item = (&Edge, usize)> + '_ {
        self.outgoing[idx]
            .iter()
            .map(move |&e| (&self.edges[e], self.ends[e].1))
    }

    pub(crate) fn is_terminal_at(&self, idx: usize) -> bool {
        self.outgoing[idx].is_empty()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("start", &self.start().name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::executor::PassthroughExecutor;

    fn diamond() -> Graph {
        let mut b = GraphBuilder::new("diamond");
        for name in ["a", "b", "c", "d"] {
            b.add_node(NodeSpec::new(name, PassthroughExecutor)).unwrap();
        }
        b.add_edge("a", "b", Condition::expr("go == true", true).unwrap())
            .unwrap()
            .add_edge("a", "c", None)
            .unwrap()
            .add_edge("b", "d", None)
            .unwrap()
            .add_edge("c", "d", None)
            .unwrap()
            .set_start("a")
            .unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_adjacency_queries() {
        let g = diamond();
        let out: Vec<&str> = g.outgoing("a").iter().map(|e| e.to.as_str()).collect();
        assert_eq!(out, vec!["b", "c"]);
        let inc: Vec<&str> = g.incoming("d").iter().map(|e| e.from.as_str()).collect();
        assert_eq!(inc, vec!["b", "c"]);
        assert!(g.outgoing("missing").is_empty());
        assert_eq!(g.terminals(), vec!["d"]);
        assert!(g.node("c").is_some());
        assert!(g.node("z").is_none());
    }

    #[test]
    fn test_snapshot_serializes() {
        let snap = diamond().snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["start"], "a");
        assert_eq!(json["edges"][0]["condition"], "go == true");
        assert_eq!(json["edges"][0]["fallback"], true);
        assert!(json["edges"][1].get("condition").is_none());
        assert_eq!(json["nodes"][0]["kind"], "passthrough");
    }
}
