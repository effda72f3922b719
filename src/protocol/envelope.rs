//! Immutable message envelopes with correlation IDs.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{ErrorPayload, MessageKind, Recipient, ReplyPayload, StatusPayload, TaskPayload};
use crate::error::{Error, Result};

/// Unit of communication between agents.
///
/// Fields are private: once built an envelope is never mutated, only cloned
/// or answered with a new envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    id: String,
    correlation_id: Option<String>,
    sender: String,
    recipient: Recipient,
    kind: MessageKind,
    payload: Value,
    created_at: DateTime<Utc>,
}

impl Envelope {
    fn build(
        sender: impl Into<String>,
        recipient: Recipient,
        kind: MessageKind,
        payload: Value,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            correlation_id,
            sender: sender.into(),
            recipient,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }

    /// A `task_request` with a fresh correlation ID.
    pub fn request(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        task: &TaskPayload,
    ) -> Result<Self> {
        Ok(Self::build(
            sender,
            Recipient::Agent(recipient.into()),
            MessageKind::TaskRequest,
            serde_json::to_value(task)?,
            Some(generate_id()),
        ))
    }

    /// A fire-and-forget envelope (no correlation ID).
    pub fn notify(
        sender: impl Into<String>,
        recipient: Recipient,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self::build(sender, recipient, kind, payload, None)
    }

    /// A notification for every registered agent.
    pub fn broadcast(sender: impl Into<String>, payload: Value) -> Self {
        Self::notify(sender, Recipient::All, MessageKind::Notification, payload)
    }

    /// A `status_update` for every registered agent.
    pub fn status(sender: impl Into<String>, status: &StatusPayload) -> Result<Self> {
        Ok(Self::notify(
            sender,
            Recipient::All,
            MessageKind::StatusUpdate,
            serde_json::to_value(status)?,
        ))
    }

    /// Best-effort cancellation of the request carrying `correlation_id`.
    pub fn cancel(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::build(
            sender,
            Recipient::Agent(recipient.into()),
            MessageKind::Cancel,
            Value::Null,
            Some(correlation_id.into()),
        )
    }

    /// Successful reply to this request, addressed back to its sender.
    pub fn reply(&self, sender: impl Into<String>, reply: &ReplyPayload) -> Result<Self> {
        self.answer(sender, MessageKind::TaskReply, serde_json::to_value(reply)?)
    }

    /// Error reply to this request, addressed back to its sender.
    pub fn error_reply(&self, sender: impl Into<String>, error: &ErrorPayload) -> Result<Self> {
        self.answer(sender, MessageKind::Error, serde_json::to_value(error)?)
    }

    fn answer(&self, sender: impl Into<String>, kind: MessageKind, payload: Value) -> Result<Self> {
        let correlation_id = self.correlation_id.clone().ok_or_else(|| {
            Error::InvalidEnvelope(format!("envelope {} carries no correlation id", self.id))
        })?;
        Ok(Self::build(
            sender,
            Recipient::Agent(self.sender.clone()),
            kind,
            payload,
            Some(correlation_id),
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Decode the payload into a typed structure.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::InvalidEnvelope(format!("{} payload of {}: {}", self.kind, self.id, e))
        })
    }

    /// Check if this envelope is addressed to a specific agent.
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.recipient.agent_id() == Some(agent_id)
    }
}

/// Builder for creating envelopes with fluent API.
pub struct EnvelopeBuilder {
    sender: String,
    recipient: Option<Recipient>,
    kind: MessageKind,
    payload: Value,
    correlation_id: Option<String>,
}

impl EnvelopeBuilder {
    /// Start building an envelope from an agent.
    pub fn from(agent_id: impl Into<String>) -> Self {
        Self {
            sender: agent_id.into(),
            recipient: None,
            kind: MessageKind::Notification,
            payload: Value::Null,
            correlation_id: None,
        }
    }

    /// Address to a single agent.
    pub fn to(mut self, agent_id: impl Into<String>) -> Self {
        self.recipient = Some(Recipient::Agent(agent_id.into()));
        self
    }

    /// Address to every agent subscribed to a topic.
    pub fn to_topic(mut self, topic: impl Into<String>) -> Self {
        self.recipient = Some(Recipient::Topic(topic.into()));
        self
    }

    /// Address to every registered agent.
    pub fn to_all(mut self) -> Self {
        self.recipient = Some(Recipient::All);
        self
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Build the envelope.
    ///
    /// Requests get a fresh correlation ID when none was set; broadcasts must
    /// be `status_update` or `notification` and carry none.
    pub fn build(self) -> Result<Envelope> {
        let recipient = self
            .recipient
            .ok_or_else(|| Error::InvalidEnvelope("recipient is required".to_string()))?;

        if recipient.is_broadcast() {
            if !self.kind.is_broadcastable() {
                return Err(Error::InvalidEnvelope(format!(
                    "{} cannot be broadcast",
                    self.kind
                )));
            }
            if self.correlation_id.is_some() {
                return Err(Error::InvalidEnvelope(
                    "broadcasts never expect replies".to_string(),
                ));
            }
        }

        let correlation_id = match (self.kind, self.correlation_id) {
            (MessageKind::TaskRequest, None) => Some(generate_id()),
            (kind, None) if kind.is_reply() || kind == MessageKind::Cancel => {
                return Err(Error::InvalidEnvelope(format!(
                    "{} requires a correlation id",
                    kind
                )))
            }
            (_, cid) => cid,
        };

        Ok(Envelope::build(
            self.sender,
            recipient,
            self.kind,
            self.payload,
            correlation_id,
        ))
    }
}

pub(crate) fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}
