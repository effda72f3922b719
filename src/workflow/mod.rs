//! Workflow definitions, sessions and the step state machine.

pub mod backoff;
pub mod definition;
pub mod machine;
pub mod session;

pub use backoff::Backoff;
pub use definition::{
    builtin, catalog, shortest_step_timeout, ConflictPolicy, StepDefinition, WorkflowDefinition,
    WorkflowType, MAX_STEP_RETRIES,
};
pub use machine::{advance, Directive, SessionEvent, Transition};
pub use session::{ErrorInfo, SessionStatus, WorkflowSession};
