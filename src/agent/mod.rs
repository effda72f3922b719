//! Agent contract, lifecycle state and registry snapshots.
//!
//! Every agent variant implements [`Agent`]; the bus and the orchestrator only
//! ever see `Arc<dyn Agent>` and the [`AgentHandle`] snapshots the registry
//! hands out.

pub mod contract;
pub mod roster;
pub(crate) mod runtime;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::error::FailureCode;
use crate::protocol::{Envelope, MailboxStats};
use crate::services::ServiceError;

pub use contract::{call_external, ExecutionContract};
pub use roster::{default_pack, AgentRole, RoleAgent};

/// Failure raised by an agent while handling an envelope.
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("External dependency failed: {0}")]
    External(String),

    #[error("Unsupported capability: {0}")]
    Unsupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal failure: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn code(&self) -> FailureCode {
        match self {
            AgentError::External(_) => FailureCode::ExternalDependency,
            AgentError::Unsupported(_) => FailureCode::Unsupported,
            AgentError::InvalidInput(_) => FailureCode::InvalidInput,
            AgentError::Internal(_) => FailureCode::Internal,
        }
    }

    /// Internal failures put the agent into the `error` state.
    pub fn is_internal(&self) -> bool {
        matches!(self, AgentError::Internal(_))
    }
}

impl From<ServiceError> for AgentError {
    fn from(e: ServiceError) -> Self {
        AgentError::External(e.to_string())
    }
}

impl From<crate::error::Error> for AgentError {
    fn from(e: crate::error::Error) -> Self {
        match e {
            crate::error::Error::InvalidEnvelope(msg) => AgentError::InvalidInput(msg),
            crate::error::Error::ExternalDependency(msg) => AgentError::External(msg),
            other => AgentError::Internal(other.to_string()),
        }
    }
}

/// Capability set every agent variant implements.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique agent id used for routing.
    fn id(&self) -> &str;

    /// Task kinds this agent can perform.
    fn capabilities(&self) -> Vec<String>;

    /// Handle one envelope. Replies must be built from the request
    /// (`Envelope::reply`) so they carry its correlation id.
    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, AgentError>;

    async fn on_start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Busy,
    Error,
    Stopped,
}

impl AgentState {
    /// Whether the agent currently accepts task requests.
    pub fn is_available(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Busy)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Busy => write!(f, "busy"),
            AgentState::Error => write!(f, "error"),
            AgentState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Live state and counters shared between an agent runtime and the registry.
#[derive(Debug)]
pub(crate) struct AgentMonitor {
    state: RwLock<AgentState>,
    completed: AtomicU64,
    failed: AtomicU64,
    changed: Arc<Notify>,
}

impl AgentMonitor {
    pub(crate) fn new(changed: Arc<Notify>) -> Self {
        Self {
            state: RwLock::new(AgentState::Idle),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            changed,
        }
    }

    pub(crate) fn state(&self) -> AgentState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: AgentState) {
        *self.state.write() = state;
        self.changed.notify_waiters();
    }

    /// Move `from -> to`; returns false when the agent was in another state.
    pub(crate) fn transition(&self, from: AgentState, to: AgentState) -> bool {
        let mut state = self.state.write();
        if *state != from {
            return false;
        }
        *state = to;
        drop(state);
        self.changed.notify_waiters();
        true
    }

    pub(crate) fn record_success(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Read-only snapshot of a registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentHandle {
    pub agent_id: String,
    pub capabilities: BTreeSet<String>,
    pub topics: BTreeSet<String>,
    pub state: AgentState,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub mailbox: MailboxStats,
}

impl AgentHandle {
    pub fn can(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Mean historical error rate in `[0, 1]`.
    pub fn error_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.tasks_failed as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_transitions() {
        let monitor = AgentMonitor::new(Arc::new(Notify::new()));
        assert_eq!(monitor.state(), AgentState::Idle);
        assert!(monitor.transition(AgentState::Idle, AgentState::Busy));
        assert!(!monitor.transition(AgentState::Error, AgentState::Idle));
        monitor.set_state(AgentState::Error);
        assert!(monitor.transition(AgentState::Error, AgentState::Idle));
    }

    #[test]
    fn test_error_rate() {
        let mut handle = AgentHandle {
            agent_id: "art".to_string(),
            capabilities: BTreeSet::from(["art.asset_match".to_string()]),
            topics: BTreeSet::new(),
            state: AgentState::Idle,
            tasks_completed: 0,
            tasks_failed: 0,
            mailbox: MailboxStats {
                agent_id: "art".to_string(),
                depth: 0,
                capacity: 8,
            },
        };
        assert_eq!(handle.error_rate(), 0.0);
        handle.tasks_completed = 3;
        handle.tasks_failed = 1;
        assert!((handle.error_rate() - 0.25).abs() < f64::EPSILON);
        assert!(handle.can("art.asset_match"));
    }

    #[test]
    fn test_agent_error_codes() {
        assert_eq!(AgentError::External("x".into()).code(), FailureCode::ExternalDependency);
        assert!(AgentError::Internal("x".into()).is_internal());
        let err: AgentError = ServiceError::Timeout.into();
        assert_eq!(err.code(), FailureCode::ExternalDependency);
    }
}
