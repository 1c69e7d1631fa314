//! Declarative workflow definitions loaded from TOML.
//!
//! A definition compiles into a [`Graph`] through [`GraphBuilder`], so every
//! build-time rule applies to it as well.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use switchyard_core::config::RetryConfig;
use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::traits::AgentClient;

use crate::condition::Condition;
use crate::executor::{AgentExecutor, Executor, PassthroughExecutor, TemplateExecutor};
use crate::graph::{Graph, GraphBuilder, NodeSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start: String,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Agent,
    Template,
    Passthrough,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub description: Option<String>,
    /// Agent instructions (`kind = "agent"`).
    #[serde(default)]
    pub instructions: Option<String>,
    /// JSON Schema requested from the agent (`kind = "agent"`).
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
    /// Text template (`kind = "template"`).
    #[serde(default)]
    pub template: Option<String>,
    /// Merge inputs; empty for single-input nodes.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Canned agent reply used for offline runs.
    #[serde(default)]
    pub fixture: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    /// Condition expression, e.g. `estimated_budget < 50000`.
    #[serde(default)]
    pub when: Option<String>,
    /// Value used when `when` cannot be evaluated.
    #[serde(default = "default_fallback")]
    pub fallback: bool,
    /// Display name of the condition; defaults to the expression text.
    #[serde(default)]
    pub name: Option<String>,
}

fn default_fallback() -> bool { true }

impl WorkflowDef {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| SwitchyardError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SwitchyardError::Config(e.to_string()))
    }

    /// Compile into a validated graph. Agent nodes call `agent`.
    pub fn into_graph(&self, agent: Arc<dyn AgentClient>) -> Result<Graph> {
        let mut builder = GraphBuilder::new(self.name.clone());
        for node in &self.nodes {
            builder.add_node(node.to_spec(&agent)?)?;
        }
        for edge in &self.edges {
            let condition = edge
                .when
                .as_deref()
                .map(|expr| Condition::expr(expr, edge.fallback))
                .transpose()?
                .map(|cond| match &edge.name {
                    Some(name) => cond.named(name.clone()),
                    None => cond,
                });
            builder.add_edge(&edge.from, &edge.to, condition)?;
        }
        builder.set_start(&self.start)?;
        builder.build()
    }

    /// Canned replies of the nodes that declare one.
    pub fn fixtures(&self) -> HashMap<String, serde_json::Value> {
        self.nodes
            .iter()
            .filter_map(|n| n.fixture.clone().map(|f| (n.name.clone(), f)))
            .collect()
    }
}

impl NodeDef {
    fn to_spec(&self, agent: &Arc<dyn AgentClient>) -> Result<NodeSpec> {
        let executor: Arc<dyn Executor> = match self.kind {
            NodeKind::Agent => {
                let instructions = self.instructions.clone().ok_or_else(|| {
                    SwitchyardError::Config(format!("agent node '{}' has no instructions", self.name))
                })?;
                let mut executor = AgentExecutor::new(instructions, agent.clone());
                if let Some(schema) = &self.schema {
                    executor = executor.with_schema(schema.clone());
                }
                Arc::new(executor)
            }
            NodeKind::Template => {
                let template = self.template.clone().ok_or_else(|| {
                    SwitchyardError::Config(format!("template node '{}' has no template", self.name))
                })?;
                Arc::new(TemplateExecutor::new(template))
            }
            NodeKind::Passthrough => Arc::new(PassthroughExecutor),
        };

        let mut spec = NodeSpec::shared(self.name.clone(), executor);
        if !self.inputs.is_empty() {
            spec = spec.with_merge_inputs(self.inputs.clone());
        }
        if let Some(description) = &self.description {
            spec = spec.with_description(description.clone());
        }
        if let Some(schema) = &self.schema {
            spec = spec.with_output_schema(schema.clone());
        }
        if let Some(secs) = self.timeout_secs {
            spec = spec.with_timeout(Duration::from_secs(secs));
        }
        if let Some(retry) = &self.retry {
            spec = spec.with_retry(retry.clone());
        }
        Ok(spec)
    }
}
