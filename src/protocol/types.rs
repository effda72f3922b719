//! Message kinds, addressing and typed payloads for the agent protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FailureCode;

/// Wire marker for "every registered agent".
pub const BROADCAST_ALL: &str = "*";

/// Prefix marking a topic recipient on the wire (`topic:<name>`).
pub const TOPIC_PREFIX: &str = "topic:";

/// Message category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Work item expecting exactly one reply
    TaskRequest,
    /// Successful reply to a task request
    TaskReply,
    /// Agent busy/idle and progress notices
    StatusUpdate,
    /// Free-form notification
    Notification,
    /// Failed reply to a task request
    Error,
    /// Best-effort cancellation of an in-flight request
    Cancel,
}

impl MessageKind {
    /// Kinds allowed to fan out to several agents.
    pub fn is_broadcastable(&self) -> bool {
        matches!(self, MessageKind::StatusUpdate | MessageKind::Notification)
    }

    /// Kinds that answer a request.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageKind::TaskReply | MessageKind::Error)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::TaskRequest => write!(f, "task_request"),
            MessageKind::TaskReply => write!(f, "task_reply"),
            MessageKind::StatusUpdate => write!(f, "status_update"),
            MessageKind::Notification => write!(f, "notification"),
            MessageKind::Error => write!(f, "error"),
            MessageKind::Cancel => write!(f, "cancel"),
        }
    }
}

/// Envelope destination.
///
/// Serialized as a plain string: an agent id, `"*"` or `"topic:<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    Agent(String),
    All,
    Topic(String),
}

impl Recipient {
    pub fn is_broadcast(&self) -> bool {
        !matches!(self, Recipient::Agent(_))
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Recipient::Agent(id) => Some(id),
            _ => None,
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Agent(id) => write!(f, "{}", id),
            Recipient::All => write!(f, "{}", BROADCAST_ALL),
            Recipient::Topic(topic) => write!(f, "{}{}", TOPIC_PREFIX, topic),
        }
    }
}

impl From<&str> for Recipient {
    fn from(s: &str) -> Self {
        if s == BROADCAST_ALL {
            Recipient::All
        } else if let Some(topic) = s.strip_prefix(TOPIC_PREFIX) {
            Recipient::Topic(topic.to_string())
        } else {
            Recipient::Agent(s.to_string())
        }
    }
}

impl Serialize for Recipient {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Recipient::from(s.as_str()))
    }
}

/// Payload of a `task_request`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    /// Capability the recipient must perform
    pub capability: String,
    /// Owning workflow session (absent for ad-hoc requests)
    #[serde(default)]
    pub session_id: Option<String>,
    /// Step name within the session
    #[serde(default)]
    pub step: Option<String>,
    /// Context values mapped into this step
    #[serde(default)]
    pub input: Map<String, Value>,
}

impl TaskPayload {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            session_id: None,
            step: None,
            input: Map::new(),
        }
    }

    pub fn for_step(mut self, session_id: impl Into<String>, step: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self.step = Some(step.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    /// Input value rendered as text for prompts.
    pub fn input_text(&self, key: &str) -> Option<String> {
        self.input.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Output about one named entity inside a multi-target reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetMatch {
    pub target: String,
    pub output: Value,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Payload of a `task_reply`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyPayload {
    /// Step output merged into the session context
    pub output: Value,
    /// Entity this output is about (e.g. a scene id). Fan-out replies without
    /// a target all compete for one untargeted slot.
    #[serde(default)]
    pub target: Option<String>,
    /// Agent reported confidence in `[0, 1]`
    #[serde(default)]
    pub score: Option<f64>,
    /// Per-entity outputs; a fan-out step treats each as its own candidate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<TargetMatch>,
}

impl ReplyPayload {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            target: None,
            score: None,
            matches: Vec::new(),
        }
    }

    /// Reply covering several entities. `output` is the matches keyed by target.
    pub fn from_matches(matches: Vec<TargetMatch>) -> Self {
        let output = matches
            .iter()
            .map(|m| (m.target.clone(), m.output.clone()))
            .collect::<Map<String, Value>>();
        Self {
            output: Value::Object(output),
            target: None,
            score: None,
            matches,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// Payload of an `error` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: FailureCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Payload of a `status_update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusPayload {
    pub agent_id: String,
    pub state: String,
    #[serde(default)]
    pub detail: Option<String>,
}

impl StatusPayload {
    pub fn new(agent_id: impl Into<String>, state: impl ToString) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: state.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Session progress published by the orchestrator as a `status_update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressPayload {
    pub session_id: String,
    pub workflow_type: String,
    pub status: String,
    /// Step about to run (or being retried); none once the session is terminal
    #[serde(default)]
    pub step: Option<String>,
    pub steps_completed: usize,
    pub total_steps: usize,
}
