use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use switchyard_core::error::SwitchyardError;
use switchyard_core::traits::AgentClient;
use switchyard_core::types::{AgentReply, AgentRequest, Message, Payload, RunId};

/// How a node invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Retryable (timeouts, remote capability hiccups).
    #[error("transient: {0}")]
    Transient(String),
    /// Aborts the run.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Fatal(m) => m,
        }
    }
}

impl From<SwitchyardError> for NodeError {
    fn from(e: SwitchyardError) -> Self {
        if e.is_retryable() {
            Self::Transient(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

/// Everything an executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub run_id: RunId,
    pub node: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Ordered inputs: one for chain nodes, one per declared input for merge nodes.
    pub inputs: Vec<Message>,
    /// Triggered when the owning run is aborted.
    pub cancel: CancellationToken,
}

/// The unit of work behind a graph node.
///
/// Executors are shared by every run of a graph and must not keep per-run
/// state. The runner stamps the returned payload into a `Message`.
pub trait Executor: Send + Sync + 'static {
    /// Short label used in graph snapshots ("agent", "transform", ...).
    fn kind(&self) -> &str;

    fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<Payload, NodeError>>;
}

/// Invokes the language-model agent capability with fixed instructions.
pub struct AgentExecutor {
    instructions: String,
    output_schema: Option<serde_json::Value>,
    agent: Arc<dyn AgentClient>,
}

impl AgentExecutor {
    pub fn new(instructions: impl Into<String>, agent: Arc<dyn AgentClient>) -> Self {
        Self {
            instructions: instructions.into(),
            output_schema: None,
            agent,
        }
    }

    /// Ask for structured output conforming to this JSON Schema.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }
}

/// Render a node's inputs into a prompt.
///
/// A single input is passed through as text; several inputs each get a
/// section headed by the producing node's name.
pub fn build_prompt(inputs: &[Message]) -> String {
    match inputs {
        [] => String::new(),
        [only] => only.text(),
        many => many
            .iter()
            .map(|m| format!("## {}\n\n{}", m.producer(), m.text()))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n"),
    }
}

impl Executor for AgentExecutor {
    fn kind(&self) -> &str {
        "agent"
    }

    fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<Payload, NodeError>> {
        Box::pin(async move {
            let request = AgentRequest {
                agent: invocation.node.clone(),
                instructions: self.instructions.clone(),
                prompt: build_prompt(&invocation.inputs),
                output_schema: self.output_schema.clone(),
            };

            debug!(
                run_id = %invocation.run_id,
                node = %invocation.node,
                attempt = invocation.attempt,
                prompt_len = request.prompt.len(),
                "Invoking agent"
            );

            let reply = self.agent.invoke(request).await?;

            Ok(match reply {
                AgentReply::Structured(value) => Payload::Json(value),
                AgentReply::Text(text) if self.output_schema.is_some() => {
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(value) => Payload::Json(value),
                        Err(_) => Payload::Text(text),
                    }
                }
                AgentReply::Text(text) => Payload::Text(text),
            })
        })
    }
}

type TransformFn = dyn Fn(&[Message]) -> Result<Payload, NodeError> + Send + Sync;

/// A pure, synchronous transform over the inputs.
pub struct TransformExecutor {
    transform: Arc<TransformFn>,
}

impl TransformExecutor {
    pub fn new<F>(transform: F) -> Self
    where
        F: Fn(&[Message]) -> Result<Payload, NodeError> + Send + Sync + 'static,
    {
        Self {
            transform: Arc::new(transform),
        }
    }
}

impl Executor for TransformExecutor {
    fn kind(&self) -> &str {
        "transform"
    }

    fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<Payload, NodeError>> {
        let result = (self.transform)(&invocation.inputs);
        Box::pin(async move { result })
    }
}

/// Renders a text template.
///
/// `{{input}}` is replaced by the first input's text, `{{<node>}}` by the text
/// of the input produced by `<node>`.
pub struct TemplateExecutor {
    template: String,
}

impl TemplateExecutor {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, inputs: &[Message]) -> String {
        let mut out = self.template.clone();
        if let Some(first) = inputs.first() {
            out = out.replace("{{input}}", &first.text());
        }
        for input in inputs {
            out = out.replace(&format!("{{{{{}}}}}", input.producer()), &input.text());
        }
        out
    }
}

impl Executor for TemplateExecutor {
    fn kind(&self) -> &str {
        "template"
    }

    fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<Payload, NodeError>> {
        let rendered = self.render(&invocation.inputs);
        Box::pin(async move { Ok(Payload::Text(rendered)) })
    }
}

/// Forwards the first input unchanged.
#[derive(Debug, Default)]
pub struct PassthroughExecutor;

impl Executor for PassthroughExecutor {
    fn kind(&self) -> &str {
        "passthrough"
    }

    fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<Payload, NodeError>> {
        Box::pin(async move {
            invocation
                .inputs
                .into_iter()
                .next()
                .map(|m| m.payload().clone())
                .ok_or_else(|| NodeError::fatal("passthrough node received no input"))
        })
    }
}
