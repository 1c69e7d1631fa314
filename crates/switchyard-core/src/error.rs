use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchyardError {
    // Graph construction errors
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Start node already set to '{existing}', cannot set '{requested}'")]
    MultipleStart { existing: String, requested: String },

    #[error("Graph validation failed: {0}")]
    GraphValidation(#[from] ValidationError),

    // Condition errors
    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    // Agent errors
    #[error("Agent request failed: {0}")]
    AgentRequest(String),

    #[error("Agent timeout after {0}s")]
    AgentTimeout(u64),

    #[error("Agent rejected request: {0}")]
    AgentRejected(String),

    #[error("Agent response parse error: {0}")]
    AgentParse(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SwitchyardError {
    /// Whether a node invocation that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AgentRequest(_) | Self::AgentTimeout(_) | Self::Io(_))
    }
}

/// A structural invariant violated by a graph at build time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("graph has no nodes")]
    EmptyGraph,

    #[error("no start node set")]
    NoStartNode,

    #[error("start node '{node}' declares merge inputs")]
    StartNodeIsMerge { node: String },

    #[error("cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("unreachable from start: {}", .nodes.join(", "))]
    Unreachable { nodes: Vec<String> },

    #[error("merge node '{node}' declares input '{input}' more than once")]
    DuplicateMergeInput { node: String, input: String },

    #[error("merge node '{node}' declares input '{input}' but no edge connects it")]
    MergeInputNotConnected { node: String, input: String },

    #[error("merge node '{node}' has an edge from undeclared input '{from}'")]
    UnexpectedMergeSource { node: String, from: String },
}

/// Failure to convert a raw payload into a typed value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("payload parse error: {0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SwitchyardError>;
