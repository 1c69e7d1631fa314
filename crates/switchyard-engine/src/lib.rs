//! Conditional workflow engine: executors, condition-gated edges, graph
//! validation, and a concurrent runner with retry, timeouts and cancellation.

pub mod condition;
pub mod definition;
pub mod executor;
pub mod graph;
pub mod runner;

pub use condition::{Condition, Evaluation};
pub use definition::{EdgeDef, NodeDef, NodeKind, WorkflowDef};
pub use executor::{
    AgentExecutor, Executor, Invocation, NodeError, PassthroughExecutor, TemplateExecutor,
    TransformExecutor,
};
pub use graph::{Edge, Graph, GraphBuilder, GraphSnapshot, InputContract, NodeSpec};
pub use runner::{
    AttemptOutcome, RunError, RunErrorKind, RunHandle, RunResult, RunStatus, TraceEntry,
    WorkflowRunner,
};
