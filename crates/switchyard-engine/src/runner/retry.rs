use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchyard_core::config::RetryConfig;
use switchyard_core::event::{EventBus, RunEvent};
use switchyard_core::types::{Message, Payload, RunId};

use super::result::{AttemptOutcome, RunError, RunErrorKind, TraceEntry};
use crate::condition::panic_message;
use crate::executor::{Invocation, NodeError};
use crate::graph::NodeSpec;

/// Timeout and retry settings resolved for one node.
#[derive(Debug, Clone)]
pub(crate) struct AttemptPolicy {
    pub timeout: Duration,
    pub retry: RetryConfig,
}

/// What a node task reports back to the scheduler.
pub(crate) struct NodeOutcome {
    pub node: usize,
    pub result: Result<Message, RunError>,
    pub trace: Vec<TraceEntry>,
}

enum Attempt {
    Succeeded(Payload),
    Failed(NodeError),
    TimedOut,
    Cancelled,
}

pub(crate) fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Run one node to completion: attempts with a timeout each, transient
/// failures retried with backoff, all of it abandoned when `cancel` fires.
pub(crate) async fn execute_node(
    index: usize,
    node: NodeSpec,
    run_id: RunId,
    inputs: Vec<Message>,
    policy: AttemptPolicy,
    cancel: CancellationToken,
    events: Arc<EventBus>,
) -> NodeOutcome {
    let max_attempts = policy.retry.max_retries + 1;
    let mut trace = Vec::new();
    let mut attempt = 1;

    let result = loop {
        if cancel.is_cancelled() {
            break Err(RunError::new(
                RunErrorKind::Cancelled,
                Some(node.name.clone()),
                "cancelled before start",
            ));
        }

        info!(run_id = %run_id, node = %node.name, attempt, "Executing graph node");
        events.publish(RunEvent::NodeStarted {
            run_id: run_id.clone(),
            node: node.name.clone(),
            attempt,
        });

        let started_at = Utc::now();
        let started = Instant::now();
        let invocation = Invocation {
            run_id: run_id.clone(),
            node: node.name.clone(),
            attempt,
            inputs: inputs.clone(),
            cancel: cancel.clone(),
        };
        // Executors may panic while building their future, so invoke inside the guard.
        let call = AssertUnwindSafe(async { node.executor.invoke(invocation).await }).catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Attempt::Cancelled,
            res = tokio::time::timeout(policy.timeout, call) => match res {
                Err(_) => Attempt::TimedOut,
                Ok(Err(panic)) => Attempt::Failed(NodeError::fatal(format!(
                    "executor panicked: {}",
                    panic_message(panic.as_ref())
                ))),
                Ok(Ok(Ok(payload))) => match node.check_output(&payload) {
                    Ok(()) => Attempt::Succeeded(payload),
                    Err(e) => Attempt::Failed(e),
                },
                Ok(Ok(Err(e))) => Attempt::Failed(e),
            },
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (recorded, failure) = match outcome {
            Attempt::Succeeded(payload) => {
                trace.push(TraceEntry {
                    node: node.name.clone(),
                    attempt,
                    started_at,
                    elapsed_ms,
                    outcome: AttemptOutcome::Succeeded,
                });
                debug!(run_id = %run_id, node = %node.name, attempt, elapsed_ms, "Node execution complete");
                events.publish(RunEvent::NodeCompleted {
                    run_id: run_id.clone(),
                    node: node.name.clone(),
                    attempt,
                    elapsed_ms,
                });
                break Ok(Message::new(run_id.clone(), node.name.clone(), attempt, payload));
            }
            Attempt::Cancelled => {
                trace.push(TraceEntry {
                    node: node.name.clone(),
                    attempt,
                    started_at,
                    elapsed_ms,
                    outcome: AttemptOutcome::Cancelled,
                });
                debug!(run_id = %run_id, node = %node.name, attempt, "Node cancelled");
                break Err(RunError::new(
                    RunErrorKind::Cancelled,
                    Some(node.name.clone()),
                    "cancelled while running",
                ));
            }
            Attempt::TimedOut => (
                AttemptOutcome::TimedOut,
                NodeError::transient(format!("timed out after {}ms", policy.timeout.as_millis())),
            ),
            Attempt::Failed(e) => (
                AttemptOutcome::Failed {
                    error: e.message().to_string(),
                    transient: e.is_transient(),
                },
                e,
            ),
        };

        trace.push(TraceEntry {
            node: node.name.clone(),
            attempt,
            started_at,
            elapsed_ms,
            outcome: recorded,
        });

        if failure.is_transient() && attempt < max_attempts {
            let backoff = calculate_backoff(attempt - 1, &policy.retry);
            warn!(
                run_id = %run_id,
                node = %node.name,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %failure,
                "Retrying graph node"
            );
            events.publish(RunEvent::NodeRetrying {
                run_id: run_id.clone(),
                node: node.name.clone(),
                attempt,
                backoff_ms: backoff.as_millis() as u64,
                error: failure.message().to_string(),
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    break Err(RunError::new(
                        RunErrorKind::Cancelled,
                        Some(node.name.clone()),
                        "cancelled during backoff",
                    ));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
            continue;
        }

        error!(run_id = %run_id, node = %node.name, attempt, error = %failure, "Graph node failed");
        events.publish(RunEvent::NodeFailed {
            run_id: run_id.clone(),
            node: node.name.clone(),
            attempt,
            error: failure.message().to_string(),
        });

        break Err(if failure.is_transient() {
            RunError::new(
                RunErrorKind::RetriesExhausted,
                Some(node.name.clone()),
                format!("{} failed after {} attempts: {}", node.name, attempt, failure.message()),
            )
        } else {
            RunError::new(
                RunErrorKind::NodeFailed,
                Some(node.name.clone()),
                format!("{} failed: {}", node.name, failure.message()),
            )
        });
    };

    NodeOutcome {
        node: index,
        result,
        trace,
    }
}
