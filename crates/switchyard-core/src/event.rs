use serde::{Deserialize, Serialize};

use crate::types::RunId;

/// A run-time consistency violation that is logged, not fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    /// A node that already received its input got another triggering message.
    DuplicateArrival { node: String, from: String },
    /// A merge node was still missing inputs when the run drained.
    StarvedMerge { node: String, missing: Vec<String> },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateArrival { node, from } => {
                write!(f, "duplicate arrival at '{}' from '{}'", node, from)
            }
            Self::StarvedMerge { node, missing } => {
                write!(f, "merge node '{}' never received: {}", node, missing.join(", "))
            }
        }
    }
}

/// Run event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted { run_id: RunId, graph: String },
    NodeStarted { run_id: RunId, node: String, attempt: u32 },
    NodeRetrying { run_id: RunId, node: String, attempt: u32, backoff_ms: u64, error: String },
    NodeCompleted { run_id: RunId, node: String, attempt: u32, elapsed_ms: u64 },
    NodeFailed { run_id: RunId, node: String, attempt: u32, error: String },
    EdgeFired { run_id: RunId, from: String, to: String },
    EdgeSkipped { run_id: RunId, from: String, to: String },
    /// A condition could not be evaluated and its declared fallback was used.
    ConditionFallback { run_id: RunId, from: String, to: String, condition: String, value: bool, reason: String },
    Anomaly { run_id: RunId, anomaly: Anomaly },
    RunCompleted { run_id: RunId, elapsed_ms: u64 },
    RunFailed { run_id: RunId, error: String },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeRetrying { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::EdgeFired { run_id, .. }
            | Self::EdgeSkipped { run_id, .. }
            | Self::ConditionFallback { run_id, .. }
            | Self::Anomaly { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(RunEvent::RunCompleted {
            run_id: RunId::new(),
            elapsed_ms: 1,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let run_id = RunId::new();
        bus.publish(RunEvent::EdgeFired {
            run_id: run_id.clone(),
            from: "a".into(),
            to: "b".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), &run_id);
        assert!(matches!(event, RunEvent::EdgeFired { ref to, .. } if to == "b"));
    }

    #[test]
    fn test_anomaly_display() {
        let a = Anomaly::DuplicateArrival {
            node: "summarizer".into(),
            from: "documenter".into(),
        };
        assert_eq!(a.to_string(), "duplicate arrival at 'summarizer' from 'documenter'");
    }
}
