use std::sync::Arc;
use std::time::Duration;

use switchyard_core::config::RetryConfig;
use switchyard_core::types::Payload;

use crate::executor::{Executor, NodeError};

/// Which messages a node waits for before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InputContract {
    /// Runs on the first message that reaches it.
    #[default]
    Single,
    /// Waits for one message from each listed producer and receives them
    /// in this order.
    Merge(Vec<String>),
}

impl InputContract {
    pub fn is_merge(&self) -> bool {
        matches!(self, Self::Merge(_))
    }

    /// Declared producers, empty for single-input nodes.
    pub fn sources(&self) -> &[String] {
        match self {
            Self::Single => &[],
            Self::Merge(sources) => sources,
        }
    }
}

/// A node in the workflow graph.
///
/// The executor is shared between runs; everything else is static
/// configuration read by the builder and the runner.
#[derive(Clone)]
pub struct NodeSpec {
    /// Unique name within the graph.
    pub name: String,
    pub executor: Arc<dyn Executor>,
    pub inputs: InputContract,
    pub description: Option<String>,
    /// JSON Schema the node's output is expected to follow.
    pub output_schema: Option<serde_json::Value>,
    /// Overrides `engine.node_timeout_secs`.
    pub timeout: Option<Duration>,
    /// Overrides the run-wide retry policy.
    pub retry: Option<RetryConfig>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, executor: impl Executor) -> Self {
        Self::shared(name, Arc::new(executor))
    }

    /// Create a node around an executor that is also used elsewhere.
    pub fn shared(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: name.into(),
            executor,
            inputs: InputContract::Single,
            description: None,
            output_schema: None,
            timeout: None,
            retry: None,
        }
    }

    /// Wait for one message from each of `sources`.
    pub fn with_merge_inputs<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.inputs = InputContract::Merge(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn kind(&self) -> &str {
        self.executor.kind()
    }

    /// Check a produced payload against the declared output schema.
    ///
    /// Only the shape is enforced: the payload must be JSON, an object when
    /// the schema says so, and carry every `required` property. A mismatch
    /// is a fatal node error.
    pub fn check_output(&self, payload: &Payload) -> Result<(), NodeError> {
        let Some(schema) = &self.output_schema else {
            return Ok(());
        };
        let value = payload
            .to_json()
            .map_err(|e| NodeError::fatal(format!("output of '{}' is not JSON: {}", self.name, e)))?;

        let wants_object = schema.get("type").and_then(|t| t.as_str()) == Some("object");
        let required = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|k| k.as_str()).collect::<Vec<_>>())
            .unwrap_or_default();
        if !wants_object && required.is_empty() {
            return Ok(());
        }

        let Some(object) = value.as_object() else {
            return Err(NodeError::fatal(format!(
                "output of '{}' is not a JSON object",
                self.name
            )));
        };
        if let Some(missing) = required.iter().find(|k| !object.contains_key(**k)) {
            return Err(NodeError::fatal(format!(
                "output of '{}' is missing required field '{}'",
                self.name, missing
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("kind", &self.executor.kind())
            .field("inputs", &self.inputs)
            .field("timeout", &self.timeout)
            .finish()
    }
}
