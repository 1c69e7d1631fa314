use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;

/// Producer name carried by the message that seeds a run.
pub const INPUT_PRODUCER: &str = "$input";

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data produced by a node: free-form text or a structured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Render the payload as text. JSON strings are unquoted.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(serde_json::Value::String(s)) => s.clone(),
            Self::Json(v) => v.to_string(),
        }
    }

    /// View the payload as a JSON value, parsing text payloads.
    pub fn to_json(&self) -> Result<serde_json::Value, ParseError> {
        match self {
            Self::Text(s) => Ok(serde_json::from_str(s)?),
            Self::Json(v) => Ok(v.clone()),
        }
    }

    /// Fallible conversion into a typed value.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ParseError> {
        match self {
            Self::Text(s) => Ok(serde_json::from_str(s)?),
            Self::Json(v) => Ok(T::deserialize(v)?),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// An immutable node output, tagged with the run and node that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    run_id: RunId,
    producer: String,
    attempt: u32,
    payload: Payload,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(run_id: RunId, producer: impl Into<String>, attempt: u32, payload: Payload) -> Self {
        Self {
            run_id,
            producer: producer.into(),
            attempt,
            payload,
            created_at: Utc::now(),
        }
    }

    /// The message that seeds a run.
    pub fn input(run_id: RunId, payload: Payload) -> Self {
        Self::new(run_id, INPUT_PRODUCER, 0, payload)
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn text(&self) -> String {
        self.payload.as_text()
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ParseError> {
        self.payload.parse()
    }
}

/// A request sent to the language-model agent capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Name of the node issuing the request.
    pub agent: String,
    /// Standing instructions for the agent.
    pub instructions: String,
    /// The rendered prompt built from the node's inputs.
    pub prompt: String,
    /// JSON Schema the reply should conform to, if structured output is wanted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// What the agent capability answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AgentReply {
    Text(String),
    Structured(serde_json::Value),
}

impl AgentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Evaluation {
        overall_score: u32,
        estimated_budget: f64,
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn test_parse_text_payload() {
        let p = Payload::text(r#"{"overall_score": 80, "estimated_budget": 42000.0}"#);
        let eval: Evaluation = p.parse().unwrap();
        assert_eq!(eval.overall_score, 80);
        assert_eq!(eval.estimated_budget, 42000.0);
    }

    #[test]
    fn test_parse_json_payload() {
        let p = Payload::Json(serde_json::json!({"overall_score": 55, "estimated_budget": 9.5}));
        let eval: Evaluation = p.parse().unwrap();
        assert_eq!(eval.overall_score, 55);
    }

    #[test]
    fn test_parse_malformed_payload() {
        let p = Payload::text("the proposal looks great");
        assert!(p.parse::<Evaluation>().is_err());

        let p = Payload::Json(serde_json::json!({"overall_score": "high"}));
        assert!(p.parse::<Evaluation>().is_err());
    }

    #[test]
    fn test_as_text() {
        assert_eq!(Payload::text("hi").as_text(), "hi");
        assert_eq!(Payload::Json(serde_json::json!("quoted")).as_text(), "quoted");
        assert_eq!(Payload::Json(serde_json::json!({"a": 1})).as_text(), r#"{"a":1}"#);
    }

    #[test]
    fn test_input_message() {
        let run = RunId::new();
        let msg = Message::input(run.clone(), Payload::text("start"));
        assert_eq!(msg.producer(), INPUT_PRODUCER);
        assert_eq!(msg.attempt(), 0);
        assert_eq!(msg.run_id(), &run);
        assert_eq!(msg.text(), "start");
    }
}
