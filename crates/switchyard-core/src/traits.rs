use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{AgentReply, AgentRequest};

/// Language-model agent capability.
///
/// Transport, authentication, and conversation state are the implementor's
/// concern. Transient failures should be reported as
/// `SwitchyardError::AgentRequest` or `SwitchyardError::AgentTimeout` so the
/// runner retries them.
pub trait AgentClient: Send + Sync + 'static {
    /// Send instructions and a prompt, receive text or structured data.
    fn invoke(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>>;
}
