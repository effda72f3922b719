//! Error types for StudioCrew.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Request {correlation_id} timed out after {after_ms}ms")]
    Timeout { correlation_id: String, after_ms: u64 },

    #[error("External dependency failed: {0}")]
    ExternalDependency(String),

    #[error("Conflict unresolved: {0}")]
    ConflictUnresolved(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify this error for step failure bookkeeping.
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Error::UnknownRecipient(_) => FailureCode::UnknownRecipient,
            Error::AgentUnavailable(_) => FailureCode::AgentUnavailable,
            Error::Timeout { .. } => FailureCode::Timeout,
            Error::ExternalDependency(_) => FailureCode::ExternalDependency,
            Error::ConflictUnresolved(_) => FailureCode::ConflictUnresolved,
            Error::InvalidEnvelope(_) | Error::InvalidTransition(_) => FailureCode::InvalidInput,
            _ => FailureCode::Internal,
        }
    }
}

/// Failure classification carried in error replies and session error info.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    UnknownRecipient,
    AgentUnavailable,
    Timeout,
    ExternalDependency,
    ConflictUnresolved,
    Unsupported,
    InvalidInput,
    Internal,
}

impl FailureCode {
    /// Whether the workflow layer may re-attempt a step that failed this way.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureCode::ConflictUnresolved | FailureCode::Unsupported | FailureCode::InvalidInput
        )
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::UnknownRecipient => write!(f, "unknown_recipient"),
            FailureCode::AgentUnavailable => write!(f, "agent_unavailable"),
            FailureCode::Timeout => write!(f, "timeout"),
            FailureCode::ExternalDependency => write!(f, "external_dependency"),
            FailureCode::ConflictUnresolved => write!(f, "conflict_unresolved"),
            FailureCode::Unsupported => write!(f, "unsupported"),
            FailureCode::InvalidInput => write!(f, "invalid_input"),
            FailureCode::Internal => write!(f, "internal"),
        }
    }
}
