//! Agent communication protocol for StudioCrew.
//!
//! This module defines the wire-level shape of inter-agent messages:
//! - Immutable envelopes with correlation IDs
//! - Message kinds, recipients and typed payloads
//! - Bounded per-agent mailboxes
//! - The pending-reply table used for request/reply correlation

pub mod correlation;
pub mod envelope;
pub mod mailbox;
pub mod types;

pub use correlation::{PendingReplies, PendingReply, ReplyOutcome};
pub use envelope::{Envelope, EnvelopeBuilder};
pub use mailbox::{Mailbox, MailboxStats};
pub use types::{
    ErrorPayload, MessageKind, ProgressPayload, Recipient, ReplyPayload, StatusPayload, TargetMatch,
    TaskPayload, BROADCAST_ALL,
};
