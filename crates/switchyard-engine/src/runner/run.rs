use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchyard_core::config::AppConfig;
use switchyard_core::event::{Anomaly, EventBus, RunEvent};
use switchyard_core::types::{Message, Payload, RunId};

use super::result::{RunError, RunErrorKind, RunResult, RunStatus, TraceEntry};
use super::retry::{execute_node, AttemptPolicy, NodeOutcome};
use super::store::MessageStore;
use crate::condition::Evaluation;
use crate::graph::{Graph, InputContract};

/// Everything the scheduler needs for one run.
pub(crate) struct RunContext {
    pub run_id: RunId,
    pub graph: Arc<Graph>,
    pub config: AppConfig,
    pub events: Arc<EventBus>,
    pub cancel: CancellationToken,
    pub status: watch::Sender<RunStatus>,
}

/// Mutable state of a run, owned by the scheduler loop only.
struct Scheduler {
    ctx: RunContext,
    ready: VecDeque<(usize, Vec<Message>)>,
    /// Nodes already queued or dispatched.
    triggered: Vec<bool>,
    /// Merge nodes still collecting inputs, one slot per declared source.
    collecting: BTreeMap<usize, Vec<Option<Message>>>,
    store: MessageStore,
    terminal_outputs: Vec<Message>,
    trace: Vec<TraceEntry>,
    anomalies: Vec<Anomaly>,
    /// Non-terminal nodes none of whose outgoing edges fired.
    dead_ends: Vec<String>,
    error: Option<RunError>,
}

/// Drive a run to completion. Always yields a result.
pub(crate) async fn drive(ctx: RunContext, input: Payload) -> RunResult {
    let started = Instant::now();
    let node_count = ctx.graph.nodes().len();
    let mut scheduler = Scheduler {
        ctx,
        ready: VecDeque::new(),
        triggered: vec![false; node_count],
        collecting: BTreeMap::new(),
        store: MessageStore::new(),
        terminal_outputs: Vec::new(),
        trace: Vec::new(),
        anomalies: Vec::new(),
        dead_ends: Vec::new(),
        error: None,
    };
    scheduler.run(input).await;
    scheduler.finish(started.elapsed().as_millis() as u64)
}

impl Scheduler {
    async fn run(&mut self, input: Payload) {
        let run_id = self.ctx.run_id.clone();
        let graph = self.ctx.graph.clone();

        self.ctx.status.send_replace(RunStatus::Running);
        info!(run_id = %run_id, graph = %graph.name(), "Run started");
        self.ctx.events.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            graph: graph.name().to_string(),
        });

        let start = graph.start_index();
        self.triggered[start] = true;
        self.ready.push_back((start, vec![Message::input(run_id.clone(), input)]));

        let run_deadline = self.ctx.config.engine.run_timeout();
        let deadline = async move {
            match run_deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let max_concurrency = self.ctx.config.engine.max_concurrency.max(1);
        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();

        loop {
            if self.error.is_none() && self.ctx.cancel.is_cancelled() {
                self.abort(RunError::cancelled());
            }

            while self.error.is_none() && tasks.len() < max_concurrency {
                let Some((node, inputs)) = self.ready.pop_front() else {
                    break;
                };
                self.dispatch(&mut tasks, node, inputs);
            }

            if tasks.is_empty() {
                break;
            }

            let running = self.error.is_none();
            tokio::select! {
                _ = self.ctx.cancel.cancelled(), if running => {
                    self.abort(RunError::cancelled());
                }
                _ = &mut deadline, if running => {
                    let secs = self.ctx.config.engine.run_timeout_secs.unwrap_or_default();
                    self.abort(RunError::new(
                        RunErrorKind::TimedOut,
                        None,
                        format!("run exceeded {}s", secs),
                    ));
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(outcome)) => self.complete(outcome),
                    Some(Err(e)) => {
                        error!(run_id = %run_id, error = %e, "Node task aborted");
                        self.abort(RunError::new(RunErrorKind::Internal, None, e.to_string()));
                    }
                    None => break,
                },
            }
        }
    }

    fn dispatch(&mut self, tasks: &mut JoinSet<NodeOutcome>, index: usize, inputs: Vec<Message>) {
        let node = self.ctx.graph.node_at(index).clone();
        let policy = AttemptPolicy {
            timeout: node.timeout.unwrap_or_else(|| self.ctx.config.engine.node_timeout()),
            retry: node.retry.clone().unwrap_or_else(|| self.ctx.config.retry.clone()),
        };
        tasks.spawn(execute_node(
            index,
            node,
            self.ctx.run_id.clone(),
            inputs,
            policy,
            self.ctx.cancel.clone(),
            self.ctx.events.clone(),
        ));
    }

    /// Stop the run: record the first error and cancel everything in flight.
    fn abort(&mut self, error: RunError) {
        if self.error.is_some() {
            return;
        }
        warn!(run_id = %self.ctx.run_id, error = %error, "Aborting run");
        self.error = Some(error);
        self.ready.clear();
        self.ctx.cancel.cancel();
    }

    fn complete(&mut self, outcome: NodeOutcome) {
        self.trace.extend(outcome.trace);
        match outcome.result {
            Ok(message) => {
                self.store.insert(message.clone());
                if self.error.is_none() {
                    self.route(outcome.node, message);
                }
            }
            // A node only sees cancellation once the run token fired.
            Err(e) if e.kind == RunErrorKind::Cancelled => self.abort(RunError::cancelled()),
            Err(e) => self.abort(e),
        }
    }

    /// Evaluate every outgoing edge of a finished node and deliver its output
    /// to each target whose edge fires.
    fn route(&mut self, index: usize, message: Message) {
        let graph = self.ctx.graph.clone();
        let run_id = self.ctx.run_id.clone();

        if graph.is_terminal_at(index) {
            self.terminal_outputs.push(message);
            return;
        }

        let mut fired = 0;
        for (edge, target) in graph.outgoing_at(index) {
            let evaluation = edge.evaluate(&message);
            if let Evaluation::Fallback { value, reason } = &evaluation {
                let condition = edge.condition_name().unwrap_or_default().to_string();
                warn!(
                    run_id = %run_id,
                    from = %edge.from,
                    to = %edge.to,
                    condition = %condition,
                    fallback = *value,
                    reason = %reason,
                    "Condition could not be evaluated, using fallback"
                );
                self.ctx.events.publish(RunEvent::ConditionFallback {
                    run_id: run_id.clone(),
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    condition,
                    value: *value,
                    reason: reason.clone(),
                });
            }

            if evaluation.fires() {
                fired += 1;
                debug!(run_id = %run_id, from = %edge.from, to = %edge.to, "Edge fired");
                self.ctx.events.publish(RunEvent::EdgeFired {
                    run_id: run_id.clone(),
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
                self.deliver(target, message.clone());
            } else {
                debug!(run_id = %run_id, from = %edge.from, to = %edge.to, "Edge skipped");
                self.ctx.events.publish(RunEvent::EdgeSkipped {
                    run_id: run_id.clone(),
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
        }

        if fired == 0 {
            let name = graph.node_at(index).name.clone();
            debug!(run_id = %run_id, node = %name, "No outgoing edge fired");
            self.dead_ends.push(name);
        }
    }

    /// Hand a message to `target`. Single-input nodes run on the first
    /// arrival; merge nodes run once every declared source has arrived.
    fn deliver(&mut self, target: usize, message: Message) {
        let graph = self.ctx.graph.clone();
        let node = graph.node_at(target);

        if self.triggered[target] {
            self.duplicate_arrival(&node.name, message.producer());
            return;
        }

        match &node.inputs {
            InputContract::Single => {
                self.triggered[target] = true;
                self.ready.push_back((target, vec![message]));
            }
            InputContract::Merge(sources) => {
                let Some(slot) = sources.iter().position(|s| s == message.producer()) else {
                    self.duplicate_arrival(&node.name, message.producer());
                    return;
                };
                let slots = self
                    .collecting
                    .entry(target)
                    .or_insert_with(|| vec![None; sources.len()]);
                if slots[slot].is_some() {
                    self.duplicate_arrival(&node.name, message.producer());
                    return;
                }
                slots[slot] = Some(message);

                if slots.iter().all(Option::is_some) {
                    let inputs = self
                        .collecting
                        .remove(&target)
                        .unwrap_or_default()
                        .into_iter()
                        .flatten()
                        .collect();
                    self.triggered[target] = true;
                    self.ready.push_back((target, inputs));
                }
            }
        }
    }

    fn duplicate_arrival(&mut self, node: &str, from: &str) {
        warn!(run_id = %self.ctx.run_id, node = %node, from = %from, "Duplicate arrival ignored");
        self.record_anomaly(Anomaly::DuplicateArrival {
            node: node.to_string(),
            from: from.to_string(),
        });
    }

    fn record_anomaly(&mut self, anomaly: Anomaly) {
        self.ctx.events.publish(RunEvent::Anomaly {
            run_id: self.ctx.run_id.clone(),
            anomaly: anomaly.clone(),
        });
        self.anomalies.push(anomaly);
    }

    fn finish(mut self, elapsed_ms: u64) -> RunResult {
        let run_id = self.ctx.run_id.clone();

        if self.error.is_none() {
            let graph = self.ctx.graph.clone();
            for (index, slots) in std::mem::take(&mut self.collecting) {
                let node = graph.node_at(index);
                let missing = node
                    .inputs
                    .sources()
                    .iter()
                    .zip(&slots)
                    .filter(|(_, slot)| slot.is_none())
                    .map(|(source, _)| source.clone())
                    .collect::<Vec<_>>();
                warn!(run_id = %run_id, node = %node.name, missing = ?missing, "Merge node starved");
                self.record_anomaly(Anomaly::StarvedMerge {
                    node: node.name.clone(),
                    missing,
                });
            }

            if self.terminal_outputs.is_empty() {
                self.error = Some(RunError::new(
                    RunErrorKind::DeadEnd,
                    self.dead_ends.last().cloned(),
                    if self.dead_ends.is_empty() {
                        "no terminal node produced output".to_string()
                    } else {
                        format!(
                            "no terminal node produced output; no edge fired from: {}",
                            self.dead_ends.join(", ")
                        )
                    },
                ));
            }
        }

        let status = match &self.error {
            None => {
                info!(run_id = %run_id, elapsed_ms, "Run completed");
                self.ctx.events.publish(RunEvent::RunCompleted {
                    run_id: run_id.clone(),
                    elapsed_ms,
                });
                RunStatus::Completed
            }
            Some(e) => {
                error!(run_id = %run_id, elapsed_ms, error = %e, "Run failed");
                self.ctx.events.publish(RunEvent::RunFailed {
                    run_id: run_id.clone(),
                    error: e.to_string(),
                });
                RunStatus::Failed
            }
        };
        self.ctx.status.send_replace(status);

        RunResult {
            run_id,
            graph: self.ctx.graph.name().to_string(),
            status,
            outputs: self.store.into_outputs(),
            terminal_outputs: self.terminal_outputs,
            trace: self.trace,
            anomalies: self.anomalies,
            error: self.error,
            elapsed_ms,
        }
    }
}
