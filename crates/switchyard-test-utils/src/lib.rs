//! Shared test helpers: a scripted agent and fast engine settings.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use switchyard_core::config::{AppConfig, EngineConfig, RetryConfig};
use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::traits::AgentClient;
use switchyard_core::types::{AgentReply, AgentRequest};

enum Step {
    Reply(AgentReply),
    Fail(SwitchyardError),
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    /// Repeated once the scripted steps run out.
    last_reply: Option<AgentReply>,
    delay: Option<Duration>,
}

/// An `AgentClient` that answers from a per-agent script.
///
/// Steps are consumed in the order they were added. When an agent's steps
/// are exhausted its last scripted reply is repeated; an agent with no reply
/// at all gets `AgentRejected`.
#[derive(Default)]
pub struct MockAgent {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `agent`.
    pub fn reply(self, agent: &str, reply: AgentReply) -> Self {
        self.with_script(agent, |s| {
            s.last_reply = Some(reply.clone());
            s.steps.push_back(Step::Reply(reply));
        })
    }

    /// Queue a structured JSON reply for `agent`.
    pub fn reply_json(self, agent: &str, value: serde_json::Value) -> Self {
        self.reply(agent, AgentReply::Structured(value))
    }

    /// Queue a failure for `agent`.
    pub fn fail(self, agent: &str, error: SwitchyardError) -> Self {
        self.with_script(agent, |s| s.steps.push_back(Step::Fail(error)))
    }

    /// Delay every answer from `agent`.
    pub fn delay(self, agent: &str, delay: Duration) -> Self {
        self.with_script(agent, |s| s.delay = Some(delay))
    }

    fn with_script(self, agent: &str, f: impl FnOnce(&mut Script)) -> Self {
        {
            let mut scripts = self.scripts.lock().unwrap();
            f(scripts.entry(agent.to_string()).or_default());
        }
        self
    }

    /// All requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests received for `agent`.
    pub fn calls(&self, agent: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.agent == agent)
            .count()
    }

    /// Names of the agents called, in arrival order.
    pub fn call_order(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.agent.clone())
            .collect()
    }
}

impl AgentClient for MockAgent {
    fn invoke(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>> {
        let agent = request.agent.clone();
        self.requests.lock().unwrap().push(request);

        let (step, delay) = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&agent) {
                Some(script) => {
                    let step = script
                        .steps
                        .pop_front()
                        .or_else(|| script.last_reply.clone().map(Step::Reply));
                    (step, script.delay)
                }
                None => (None, None),
            }
        };

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match step {
                Some(Step::Reply(reply)) => Ok(reply),
                Some(Step::Fail(e)) => Err(e),
                None => Err(SwitchyardError::AgentRejected(format!(
                    "no scripted reply for '{}'",
                    agent
                ))),
            }
        })
    }
}

/// Engine settings with millisecond backoff, suitable for tests.
pub fn fast_config() -> AppConfig {
    AppConfig {
        engine: EngineConfig {
            node_timeout_secs: 5,
            ..EngineConfig::default()
        },
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
    }
}

/// An evaluator reply in the project-review workflow.
pub fn evaluation(overall_score: u32, estimated_budget: f64) -> serde_json::Value {
    serde_json::json!({
        "overall_score": overall_score,
        "feedback": "Concise and feasible.",
        "estimated_budget": estimated_budget,
    })
}

/// An approver reply in the project-review workflow.
pub fn decision(approved: bool) -> serde_json::Value {
    serde_json::json!({
        "approved": approved,
        "decision_type": if approved { "APPROVED" } else { "REJECTED" },
        "reason": "Based on the evaluation score.",
        "conditions": "N/A",
    })
}
