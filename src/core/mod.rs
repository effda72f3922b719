//! Core module - message bus and agent registry.
//!
//! This module contains the heart of StudioCrew's message processing:
//! - Per-agent mailboxes and routing
//! - Request/reply correlation
//! - Agent registration and replacement

pub mod bus;
pub mod registry;

pub use bus::MessageBus;
pub use registry::AgentRegistry;
