//! Concurrent workflow runner.
//!
//! A run is push-driven: the start node receives the run input, each finished
//! node's outgoing edges are evaluated independently, and every target whose
//! edge fires becomes ready. Ready nodes run concurrently, bounded by
//! `engine.max_concurrency`. The scheduler task is the only owner of the run
//! state; node tasks report back through a `JoinSet`.
//!
//! A single-input node runs on the first message that reaches it. Later
//! arrivals are recorded as anomalies and never re-invoke it. Merge nodes run
//! once a message from every declared source has arrived.

mod result;
mod retry;
mod run;
mod store;

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use switchyard_core::config::AppConfig;
use switchyard_core::event::{EventBus, RunEvent};
use switchyard_core::types::{Payload, RunId};

pub use result::{AttemptOutcome, RunError, RunErrorKind, RunResult, RunStatus, TraceEntry};
pub use store::MessageStore;

use run::{drive, RunContext};

/// Starts runs of validated graphs.
pub struct WorkflowRunner {
    config: AppConfig,
    events: Arc<EventBus>,
}

impl WorkflowRunner {
    pub fn new(config: AppConfig) -> Self {
        let events = Arc::new(EventBus::new(config.engine.event_capacity.max(1)));
        Self { config, events }
    }

    /// Publish run events on a shared bus instead of a private one.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Spawn a run on the current tokio runtime and return immediately.
    pub fn start_run(&self, graph: Arc<crate::graph::Graph>, input: impl Into<Payload>) -> RunHandle {
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RunStatus::Pending);
        let graph_name = graph.name().to_string();

        let ctx = RunContext {
            run_id: run_id.clone(),
            graph,
            config: self.config.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            status: status_tx,
        };
        let task = tokio::spawn(drive(ctx, input.into()));

        RunHandle {
            run_id,
            graph: graph_name,
            status: status_rx,
            cancel,
            task,
        }
    }

    /// Start a run and wait for its result.
    pub async fn run(&self, graph: Arc<crate::graph::Graph>, input: impl Into<Payload>) -> RunResult {
        self.start_run(graph, input).await_result().await
    }
}

/// Handle to a run in progress.
pub struct RunHandle {
    run_id: RunId,
    graph: String,
    status: watch::Receiver<RunStatus>,
    cancel: CancellationToken,
    task: JoinHandle<RunResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Watch status transitions.
    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    /// Request cancellation. In-flight nodes are told to stop and nothing new
    /// starts; the run ends `Failed` once they have unwound.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn await_result(self) -> RunResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => RunResult::aborted(
                self.run_id,
                self.graph,
                RunError::new(RunErrorKind::Internal, None, format!("run task failed: {}", e)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;
    use switchyard_core::event::Anomaly;
    use switchyard_core::types::AgentReply;
    use switchyard_test_utils::{decision, evaluation, fast_config, MockAgent};

    use crate::condition::Condition;
    use crate::executor::{AgentExecutor, Executor, Invocation, NodeError, TransformExecutor};
    use crate::graph::{Graph, GraphBuilder, NodeSpec};

    fn constant(value: serde_json::Value) -> TransformExecutor {
        TransformExecutor::new(move |_| Ok(Payload::Json(value.clone())))
    }

    fn echo() -> TransformExecutor {
        TransformExecutor::new(|inputs| {
            let joined = inputs.iter().map(|m| m.text()).collect::<Vec<_>>().join("+");
            Ok(Payload::Text(joined))
        })
    }

    /// Sleeps, then answers; tracks how many invocations overlap.
    struct Sleepy {
        delay: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Sleepy {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Executor for Sleepy {
        fn kind(&self) -> &str {
            "sleepy"
        }

        fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<Payload, NodeError>> {
            Box::pin(async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(Payload::Text(format!("{} done", invocation.node)))
            })
        }
    }

    /// The project review workflow with scripted agents.
    fn project_review(agent: Arc<MockAgent>) -> Arc<Graph> {
        let mut b = GraphBuilder::new("project_review");
        for name in ["requester", "evaluator", "approver", "documenter", "summarizer", "rejection_finalizer"] {
            b.add_node(NodeSpec::new(name, AgentExecutor::new(format!("You are the {}.", name), agent.clone())))
                .unwrap();
        }
        b.add_edge("requester", "evaluator", None).unwrap();
        b.add_edge("evaluator", "documenter", Condition::expr("estimated_budget < 50000", true).unwrap())
            .unwrap();
        b.add_edge("evaluator", "approver", Condition::expr("estimated_budget >= 50000", false).unwrap())
            .unwrap();
        b.add_edge("approver", "documenter", Condition::expr("approved == true", true).unwrap())
            .unwrap();
        b.add_edge("approver", "rejection_finalizer", Condition::expr("approved == false", false).unwrap())
            .unwrap();
        b.add_edge("documenter", "summarizer", None).unwrap();
        b.set_start("requester").unwrap();
        Arc::new(b.build().unwrap())
    }

    fn review_agent(budget: f64) -> MockAgent {
        MockAgent::new()
            .reply("requester", AgentReply::text("Build a data platform."))
            .reply_json("evaluator", evaluation(82, budget))
            .reply("documenter", AgentReply::text("Project documentation."))
            .reply("summarizer", AgentReply::text("Executive summary."))
            .reply("rejection_finalizer", AgentReply::text("Rejection notice."))
    }

    #[tokio::test]
    async fn test_low_budget_skips_approval() {
        let agent = Arc::new(review_agent(20_000.0));
        let runner = WorkflowRunner::new(fast_config());
        let result = runner.run(project_review(agent.clone()), "Proposal").await;

        assert!(result.is_success(), "{:?}", result.error);
        assert!(result.ran("documenter"));
        assert!(!result.ran("approver"));
        assert!(!result.ran("rejection_finalizer"));
        assert_eq!(result.final_output().unwrap().producer(), "summarizer");
        assert_eq!(
            agent.call_order(),
            vec!["requester", "evaluator", "documenter", "summarizer"]
        );
    }

    #[tokio::test]
    async fn test_high_budget_approved() {
        let agent = Arc::new(review_agent(90_000.0).reply_json("approver", decision(true)));
        let result = WorkflowRunner::new(fast_config())
            .run(project_review(agent.clone()), "Proposal")
            .await;

        assert!(result.is_success());
        assert!(result.ran("approver"));
        assert!(result.ran("summarizer"));
        assert!(!result.ran("rejection_finalizer"));
        assert_eq!(agent.calls("documenter"), 1);
    }

    #[tokio::test]
    async fn test_high_budget_rejected() {
        let agent = Arc::new(review_agent(90_000.0).reply_json("approver", decision(false)));
        let result = WorkflowRunner::new(fast_config())
            .run(project_review(agent.clone()), "Proposal")
            .await;

        assert!(result.is_success());
        assert!(!result.ran("documenter"));
        assert_eq!(result.final_output().unwrap().producer(), "rejection_finalizer");
        assert_eq!(result.terminal_outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_output_uses_fallbacks() {
        // The evaluator answers prose, so neither budget condition can decide:
        // the fail-open edge fires, the fail-closed edge does not.
        let agent = Arc::new(
            MockAgent::new()
                .reply("requester", AgentReply::text("Proposal"))
                .reply("evaluator", AgentReply::text("Looks fine to me."))
                .reply("documenter", AgentReply::text("Docs"))
                .reply("summarizer", AgentReply::text("Summary")),
        );
        let runner = WorkflowRunner::new(fast_config());
        let mut events = runner.subscribe();
        let result = runner.run(project_review(agent), "Proposal").await;

        assert!(result.is_success());
        assert!(result.ran("documenter"));
        assert!(!result.ran("approver"));

        let mut fallbacks = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RunEvent::ConditionFallback { to, value, .. } = event {
                fallbacks.push((to, value));
            }
        }
        fallbacks.sort();
        assert_eq!(
            fallbacks,
            vec![("approver".to_string(), false), ("documenter".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_dead_end_fails_run() {
        let mut b = GraphBuilder::new("dead_end");
        b.add_node(NodeSpec::new("score", constant(serde_json::json!({"score": 5}))))
            .unwrap()
            .add_node(NodeSpec::new("high", echo()))
            .unwrap()
            .add_node(NodeSpec::new("low", echo()))
            .unwrap();
        b.add_edge("score", "high", Condition::expr("score > 8", false).unwrap()).unwrap();
        b.add_edge("score", "low", Condition::expr("score < 3", false).unwrap()).unwrap();
        b.set_start("score").unwrap();

        let result = WorkflowRunner::new(fast_config())
            .run(Arc::new(b.build().unwrap()), "x")
            .await;

        assert_eq!(result.status, RunStatus::Failed);
        let err = result.error.clone().unwrap();
        assert_eq!(err.kind, RunErrorKind::DeadEnd);
        assert_eq!(err.node.as_deref(), Some("score"));
        assert!(result.outputs.contains_key("score"));
    }

    #[tokio::test]
    async fn test_convergence_runs_once() {
        let mut b = GraphBuilder::new("diamond");
        for name in ["a", "b", "c"] {
            b.add_node(NodeSpec::new(name, echo())).unwrap();
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        b.add_node(NodeSpec::new(
            "d",
            TransformExecutor::new(move |inputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::Text(format!("from {}", inputs[0].producer())))
            }),
        ))
        .unwrap();
        b.add_edge("a", "b", None).unwrap().add_edge("a", "c", None).unwrap();
        b.add_edge("b", "d", None).unwrap().add_edge("c", "d", None).unwrap();
        b.set_start("a").unwrap();

        let result = WorkflowRunner::new(fast_config())
            .run(Arc::new(b.build().unwrap()), "in")
            .await;

        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.attempts("d"), 1);
        assert_eq!(result.anomalies.len(), 1);
        assert!(matches!(
            &result.anomalies[0],
            Anomaly::DuplicateArrival { node, .. } if node == "d"
        ));
    }

    #[tokio::test]
    async fn test_merge_waits_for_all_inputs() {
        let mut b = GraphBuilder::new("merge");
        b.add_node(NodeSpec::new("a", echo())).unwrap();
        b.add_node(NodeSpec::new("fast", TransformExecutor::new(|_| Ok(Payload::text("F")))))
            .unwrap();
        b.add_node(NodeSpec::new("slow", Sleepy::new(Duration::from_millis(30))))
            .unwrap();
        b.add_node(NodeSpec::new("m", echo()).with_merge_inputs(["slow", "fast"]))
            .unwrap();
        b.add_edge("a", "fast", None).unwrap().add_edge("a", "slow", None).unwrap();
        b.add_edge("fast", "m", None).unwrap().add_edge("slow", "m", None).unwrap();
        b.set_start("a").unwrap();

        let result = WorkflowRunner::new(fast_config())
            .run(Arc::new(b.build().unwrap()), "in")
            .await;

        assert!(result.is_success());
        assert_eq!(result.final_output().unwrap().text(), "slow done+F");
        assert!(result.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_starved_merge_reported() {
        let mut b = GraphBuilder::new("starved");
        b.add_node(NodeSpec::new("a", echo())).unwrap();
        b.add_node(NodeSpec::new("left", echo())).unwrap();
        b.add_node(NodeSpec::new("right", echo())).unwrap();
        b.add_node(NodeSpec::new("m", echo()).with_merge_inputs(["left", "right"]))
            .unwrap();
        b.add_node(NodeSpec::new("done", echo())).unwrap();
        b.add_edge("a", "left", Condition::new("never", false, |_| Ok(false)))
            .unwrap();
        b.add_edge("a", "right", None).unwrap();
        b.add_edge("left", "m", None).unwrap().add_edge("right", "m", None).unwrap();
        b.add_edge("a", "done", None).unwrap();
        b.set_start("a").unwrap();

        let result = WorkflowRunner::new(fast_config())
            .run(Arc::new(b.build().unwrap()), "in")
            .await;

        assert!(result.is_success());
        assert!(!result.ran("m"));
        assert_eq!(
            result.anomalies,
            vec![Anomaly::StarvedMerge {
                node: "m".into(),
                missing: vec!["left".into()]
            }]
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_run() {
        let mut b = GraphBuilder::new("slow");
        b.add_node(NodeSpec::new("wait", Sleepy::new(Duration::from_secs(3))))
            .unwrap()
            .add_node(NodeSpec::new("after", echo()))
            .unwrap();
        b.add_edge("wait", "after", None).unwrap().set_start("wait").unwrap();

        let runner = WorkflowRunner::new(fast_config());
        let handle = runner.start_run(Arc::new(b.build().unwrap()), "in");
        let mut status = handle.watch_status();
        status.wait_for(|s| *s == RunStatus::Running).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let started = std::time::Instant::now();
        let result = handle.await_result().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.clone().unwrap().kind, RunErrorKind::Cancelled);
        assert!(!result.ran("after"));
        assert_eq!(result.trace.last().unwrap().outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let mut b = GraphBuilder::new("slow");
        b.add_node(NodeSpec::new("wait", Sleepy::new(Duration::from_secs(4))))
            .unwrap()
            .set_start("wait")
            .unwrap();

        let mut config = fast_config();
        config.engine.run_timeout_secs = Some(1);
        let result = WorkflowRunner::new(config)
            .run(Arc::new(b.build().unwrap()), "in")
            .await;

        assert_eq!(result.error.clone().unwrap().kind, RunErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_fatal_error_cancels_siblings() {
        let mut b = GraphBuilder::new("fanout");
        b.add_node(NodeSpec::new("a", echo())).unwrap();
        b.add_node(NodeSpec::new(
            "broken",
            TransformExecutor::new(|_| Err(NodeError::fatal("bad input"))),
        ))
        .unwrap();
        b.add_node(NodeSpec::new("slow", Sleepy::new(Duration::from_secs(3))))
            .unwrap();
        b.add_node(NodeSpec::new("after_slow", echo())).unwrap();
        b.add_edge("a", "broken", None).unwrap().add_edge("a", "slow", None).unwrap();
        b.add_edge("slow", "after_slow", None).unwrap();
        b.set_start("a").unwrap();

        let started = std::time::Instant::now();
        let result = WorkflowRunner::new(fast_config())
            .run(Arc::new(b.build().unwrap()), "in")
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        let err = result.error.clone().unwrap();
        assert_eq!(err.kind, RunErrorKind::NodeFailed);
        assert_eq!(err.node.as_deref(), Some("broken"));
        assert!(result.ran("a"));
        assert!(!result.ran("after_slow"));
    }

    #[tokio::test]
    async fn test_transient_agent_failure_retried() {
        use switchyard_core::error::SwitchyardError;

        let agent = Arc::new(
            MockAgent::new()
                .fail("only", SwitchyardError::AgentRequest("503".into()))
                .reply("only", AgentReply::text("ok")),
        );
        let mut b = GraphBuilder::new("retry");
        b.add_node(NodeSpec::new("only", AgentExecutor::new("Answer.", agent.clone())))
            .unwrap()
            .set_start("only")
            .unwrap();

        let result = WorkflowRunner::new(fast_config())
            .run(Arc::new(b.build().unwrap()), "in")
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts("only"), 2);
        assert_eq!(result.output("only").unwrap().attempt(), 2);
        assert_eq!(agent.calls("only"), 2);
    }

    #[tokio::test]
    async fn test_max_concurrency_bounds_dispatch() {
        let sleepy = Arc::new(Sleepy::new(Duration::from_millis(20)));
        let peak = sleepy.peak.clone();

        let mut b = GraphBuilder::new("wide");
        b.add_node(NodeSpec::new("root", echo())).unwrap();
        for name in ["w1", "w2", "w3", "w4"] {
            b.add_node(NodeSpec::shared(name, sleepy.clone())).unwrap();
            b.add_edge("root", name, None).unwrap();
        }
        b.set_start("root").unwrap();

        let mut config = fast_config();
        config.engine.max_concurrency = 2;
        let result = WorkflowRunner::new(config)
            .run(Arc::new(b.build().unwrap()), "in")
            .await;

        assert!(result.is_success());
        assert_eq!(result.terminal_outputs.len(), 4);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_status_and_events() {
        let mut b = GraphBuilder::new("single");
        b.add_node(NodeSpec::new("only", echo())).unwrap().set_start("only").unwrap();
        let graph = Arc::new(b.build().unwrap());

        let runner = WorkflowRunner::new(fast_config());
        let mut events = runner.subscribe();
        let handle = runner.start_run(graph.clone(), "hello");
        let run_id = handle.run_id().clone();
        let result = handle.await_result().await;

        assert_eq!(result.run_id, run_id);
        assert_eq!(result.final_output().unwrap().text(), "hello");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.run_id(), &run_id);
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(RunEvent::RunStarted { .. })));
        assert!(matches!(seen.last(), Some(RunEvent::RunCompleted { .. })));

        // Graphs are shared between runs; each run gets its own id and state.
        let other = runner.run(graph, "again").await;
        assert_ne!(other.run_id, run_id);
        assert_eq!(other.final_output().unwrap().text(), "again");
    }

    #[tokio::test]
    async fn test_output_schema_violation_fails_node() {
        let agent = Arc::new(
            MockAgent::new()
                .reply("requester", AgentReply::text("Proposal"))
                .reply("evaluator", AgentReply::text("Looks fine to me.")),
        );
        let schema = serde_json::json!({"type": "object", "required": ["estimated_budget"]});
        let mut b = GraphBuilder::new("strict_review");
        b.add_node(NodeSpec::new("requester", AgentExecutor::new("Write a proposal.", agent.clone())))
            .unwrap()
            .add_node(
                NodeSpec::new(
                    "evaluator",
                    AgentExecutor::new("Evaluate.", agent.clone()).with_schema(schema.clone()),
                )
                .with_output_schema(schema),
            )
            .unwrap()
            .add_node(NodeSpec::new("documenter", echo()))
            .unwrap();
        b.add_edge("requester", "evaluator", None).unwrap();
        b.add_edge("evaluator", "documenter", None).unwrap();
        b.set_start("requester").unwrap();

        let result = WorkflowRunner::new(fast_config())
            .run(Arc::new(b.build().unwrap()), "in")
            .await;

        let err = result.error.clone().unwrap();
        assert_eq!(err.kind, RunErrorKind::NodeFailed);
        assert_eq!(err.node.as_deref(), Some("evaluator"));
        assert!(err.message.contains("not JSON"));
        assert_eq!(result.attempts("evaluator"), 1);
        assert_eq!(agent.calls("evaluator"), 1);
        assert!(!result.ran("documenter"));
    }
}
