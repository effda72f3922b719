//! Workflow sessions: status, progress and accumulated context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::definition::WorkflowType;
use crate::error::FailureCode;
use crate::orchestrator::conflict::ConflictRecord;
use crate::protocol::envelope::generate_id;

/// Session status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    WaitingRetry,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::WaitingRetry => write!(f, "waiting_retry"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Last failure seen by a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub step: String,
    /// Retries used when the failure was recorded
    pub retry_count: u32,
    pub code: FailureCode,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(
        step: impl Into<String>,
        retry_count: u32,
        code: FailureCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            retry_count,
            code,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// A running instance of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSession {
    pub session_id: String,
    pub workflow_type: WorkflowType,
    pub status: SessionStatus,
    pub current_step_index: usize,
    /// Completed step names in definition order
    pub steps_completed: Vec<String>,
    /// Step outputs keyed by output key, seeded with the initial context
    pub context: Map<String, Value>,
    pub error_info: Option<ErrorInfo>,
    /// Retries spent on the current step
    pub retries_used: u32,
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(workflow_type: WorkflowType, initial_context: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            session_id: generate_id(),
            workflow_type,
            status: SessionStatus::Pending,
            current_step_index: 0,
            steps_completed: Vec::new(),
            context: initial_context,
            error_info: None,
            retries_used: 0,
            conflicts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
