//! StudioCrew library root.

pub mod agent;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod services;
pub mod studio;
pub mod supervisor;
pub mod workflow;

pub use agent::{Agent, AgentError, AgentHandle, AgentState};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use self::core::{AgentRegistry, MessageBus};
pub use error::{Error, FailureCode, Result};
pub use orchestrator::Orchestrator;
pub use protocol::{Envelope, MessageKind, Recipient};
pub use studio::Studio;
pub use workflow::{SessionStatus, WorkflowSession, WorkflowType};
