use switchyard_core::types::Message;

use crate::condition::{Condition, Evaluation};

/// A directed connection between two nodes, optionally gated by a condition.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Source node name.
    pub from: String,
    /// Target node name.
    pub to: String,
    /// `None` means the edge always fires.
    pub condition: Option<Condition>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, condition: Option<Condition>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
        }
    }

    /// Decide whether this edge fires for the source node's output.
    pub fn evaluate(&self, message: &Message) -> Evaluation {
        match &self.condition {
            None => Evaluation::Fired,
            Some(condition) => condition.evaluate(message),
        }
    }

    pub fn condition_name(&self) -> Option<&str> {
        self.condition.as_ref().map(Condition::name)
    }
}
