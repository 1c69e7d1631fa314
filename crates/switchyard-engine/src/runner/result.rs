use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use switchyard_core::event::Anomaly;
use switchyard_core::types::{Message, RunId};

/// Lifecycle of a run: Pending → Running → Completed | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// A node failed with a non-retryable error.
    NodeFailed,
    /// A node kept failing transiently until its retries ran out.
    RetriesExhausted,
    /// The run drained without any terminal node producing output.
    DeadEnd,
    /// The run was cancelled by its caller.
    Cancelled,
    /// The run exceeded `engine.run_timeout_secs`.
    TimedOut,
    /// The scheduler itself failed.
    Internal,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct RunError {
    /// Node responsible, when there is one.
    pub node: Option<String>,
    pub kind: RunErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, node: Option<String>, message: impl Into<String>) -> Self {
        Self {
            node,
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(RunErrorKind::Cancelled, None, "run cancelled")
    }
}

/// How one attempt of a node ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { error: String, transient: bool },
    TimedOut,
    Cancelled,
}

/// One entry per node attempt, in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub node: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Everything a caller learns about a finished run.
///
/// Partial outputs are kept when the run fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub graph: String,
    pub status: RunStatus,
    /// Successful output of every node that ran.
    pub outputs: BTreeMap<String, Message>,
    /// Terminal node outputs in completion order.
    pub terminal_outputs: Vec<Message>,
    pub trace: Vec<TraceEntry>,
    pub anomalies: Vec<Anomaly>,
    pub error: Option<RunError>,
    pub elapsed_ms: u64,
}

impl RunResult {
    /// A result for a run whose scheduler never reported back.
    pub fn aborted(run_id: RunId, graph: impl Into<String>, error: RunError) -> Self {
        Self {
            run_id,
            graph: graph.into(),
            status: RunStatus::Failed,
            outputs: BTreeMap::new(),
            terminal_outputs: Vec::new(),
            trace: Vec::new(),
            anomalies: Vec::new(),
            error: Some(error),
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// The output of the last terminal node to complete.
    pub fn final_output(&self) -> Option<&Message> {
        self.terminal_outputs.last()
    }

    pub fn output(&self, node: &str) -> Option<&Message> {
        self.outputs.get(node)
    }

    /// Whether `node` produced output in this run.
    pub fn ran(&self, node: &str) -> bool {
        self.outputs.contains_key(node)
    }

    /// Number of attempts recorded for `node`.
    pub fn attempts(&self, node: &str) -> usize {
        self.trace.iter().filter(|t| t.node == node).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::types::Payload;

    #[test]
    fn test_final_output_is_last_terminal() {
        let run_id = RunId::new();
        let mut result = RunResult::aborted(run_id.clone(), "g", RunError::cancelled());
        assert!(result.final_output().is_none());

        result.terminal_outputs.push(Message::new(run_id.clone(), "a", 1, Payload::text("first")));
        result.terminal_outputs.push(Message::new(run_id, "b", 1, Payload::text("second")));
        assert_eq!(result.final_output().unwrap().producer(), "b");
    }

    #[test]
    fn test_trace_entry_serialization() {
        let entry = TraceEntry {
            node: "evaluator".into(),
            attempt: 2,
            started_at: Utc::now(),
            elapsed_ms: 12,
            outcome: AttemptOutcome::Failed {
                error: "connection reset".into(),
                transient: true,
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["transient"], true);
        assert_eq!(json["attempt"], 2);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RunStatus::Completed.to_string(), "completed");
        assert!(RunStatus::Failed.is_finished());
        assert!(!RunStatus::Running.is_finished());
    }
}
