use std::collections::HashMap;

use tracing::debug;

use switchyard_core::error::{Result, SwitchyardError};

use super::edge::Edge;
use super::node::NodeSpec;
use super::validate::{validate, Topology};
use super::Graph;
use crate::condition::Condition;

/// Collects nodes and edges and produces a validated, immutable `Graph`.
///
/// Registration errors (duplicate names, unknown endpoints, a second start
/// node) are reported immediately; structural errors are reported by
/// [`GraphBuilder::build`].
pub struct GraphBuilder {
    name: String,
    nodes: Vec<NodeSpec>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    ends: Vec<(usize, usize)>,
    start: Option<usize>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            ends: Vec::new(),
            start: None,
        }
    }

    pub fn add_node(&mut self, spec: NodeSpec) -> Result<&mut Self> {
        if self.index.contains_key(&spec.name) {
            return Err(SwitchyardError::DuplicateNode(spec.name));
        }
        self.index.insert(spec.name.clone(), self.nodes.len());
        self.nodes.push(spec);
        Ok(self)
    }

    /// Connect `from` to `to`. Without a condition the edge always fires.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        condition: impl Into<Option<Condition>>,
    ) -> Result<&mut Self> {
        let from_idx = self.lookup(from)?;
        let to_idx = self.lookup(to)?;
        self.edges.push(Edge::new(from, to, condition.into()));
        self.ends.push((from_idx, to_idx));
        Ok(self)
    }

    /// Designate the node that receives the run input. Setting the same node
    /// again is a no-op.
    pub fn set_start(&mut self, name: &str) -> Result<&mut Self> {
        let idx = self.lookup(name)?;
        match self.start {
            Some(existing) if existing != idx => Err(SwitchyardError::MultipleStart {
                existing: self.nodes[existing].name.clone(),
                requested: name.to_string(),
            }),
            _ => {
                self.start = Some(idx);
                Ok(self)
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| SwitchyardError::UnknownNode(name.to_string()))
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<Graph> {
        let mut outgoing = vec![Vec::new(); self.nodes.len()];
        let mut incoming = vec![Vec::new(); self.nodes.len()];
        for (edge, &(from, to)) in self.ends.iter().enumerate() {
            outgoing[from].push(edge);
            incoming[to].push(edge);
        }

        let start = validate(
            &Topology {
                nodes: &self.nodes,
                edges: &self.edges,
                ends: &self.ends,
                outgoing: &outgoing,
                incoming: &incoming,
            },
            self.start,
        )?;

        debug!(
            graph = %self.name,
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            start = %self.nodes[start].name,
            "Graph built"
        );

        Ok(Graph {
            name: self.name,
            nodes: self.nodes,
            index: self.index,
            edges: self.edges,
            ends: self.ends,
            outgoing,
            incoming,
            start,
        })
    }
}
