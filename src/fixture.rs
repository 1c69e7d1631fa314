use std::collections::HashMap;

use futures::future::BoxFuture;
use tracing::debug;

use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::traits::AgentClient;
use switchyard_core::types::{AgentReply, AgentRequest};

/// Offline agent that answers each node with the `fixture` declared in the
/// workflow file. String fixtures are text replies, anything else is
/// returned as structured output.
pub struct FixtureAgent {
    replies: HashMap<String, serde_json::Value>,
}

impl FixtureAgent {
    pub fn new(replies: HashMap<String, serde_json::Value>) -> Self {
        Self { replies }
    }
}

impl AgentClient for FixtureAgent {
    fn invoke(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>> {
        let reply = match self.replies.get(&request.agent) {
            Some(serde_json::Value::String(text)) => Ok(AgentReply::Text(text.clone())),
            Some(value) => Ok(AgentReply::Structured(value.clone())),
            None => Err(SwitchyardError::AgentRejected(format!(
                "no fixture for node '{}'",
                request.agent
            ))),
        };
        debug!(agent = %request.agent, found = reply.is_ok(), "Fixture reply");
        Box::pin(async move { reply })
    }
}
