//! Session transitions as a pure function of (session, definition, event).
//!
//! The orchestrator feeds every outcome it observes through [`advance`] and
//! carries out the returned [`Directive`]. Nothing here touches the bus or
//! the clock; `now` is supplied by the caller.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::definition::WorkflowDefinition;
use super::session::{ErrorInfo, SessionStatus, WorkflowSession};
use crate::error::{Error, FailureCode, Result};
use crate::orchestrator::conflict::ConflictRecord;

/// Something that happened to a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Start,
    StepSucceeded {
        step_index: usize,
        output: Value,
        conflicts: Vec<ConflictRecord>,
    },
    StepFailed {
        step_index: usize,
        code: FailureCode,
        message: String,
    },
    /// Backoff for the current step elapsed
    RetryDue { step_index: usize },
    Cancel,
    /// Operator resume of a failed session from the failed step
    ManualRetry { step_name: String },
    /// Re-issue the current step after a restart
    Resume,
}

/// What the orchestrator must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Issue the step; `attempt` counts from 1
    Dispatch { step_index: usize, attempt: u32 },
    /// Wait out the backoff for the `retry`-th retry of the step
    Backoff { step_index: usize, retry: u32 },
    Finished(SessionStatus),
    /// Stale event: the session is unchanged
    Ignore,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub session: WorkflowSession,
    pub directive: Directive,
}

impl Transition {
    fn ignore(session: &WorkflowSession) -> Self {
        Self {
            session: session.clone(),
            directive: Directive::Ignore,
        }
    }
}

/// Compute the next session state.
///
/// Events that arrive too late (a reply for an old step, a timer after
/// cancellation) yield [`Directive::Ignore`]. Caller requests that make no
/// sense in the current state (`Start` twice, `ManualRetry` on a running
/// session, `Cancel` on a finished one) are rejected with
/// [`Error::InvalidTransition`].
pub fn advance(
    session: &WorkflowSession,
    definition: &WorkflowDefinition,
    event: SessionEvent,
    now: DateTime<Utc>,
) -> Result<Transition> {
    if session.workflow_type != definition.workflow_type {
        return Err(Error::InvalidTransition(format!(
            "session {} is a {} workflow, definition is {}",
            session.session_id, session.workflow_type, definition.workflow_type
        )));
    }

    let mut next = session.clone();
    let directive = match event {
        SessionEvent::Start => {
            if session.status != SessionStatus::Pending {
                return Err(invalid(session, "start"));
            }
            begin_step(&mut next, definition)
        }

        SessionEvent::StepSucceeded {
            step_index,
            output,
            conflicts,
        } => {
            if !is_current(session, step_index, SessionStatus::Running) {
                return Ok(Transition::ignore(session));
            }
            let Some(step) = definition.step(step_index) else {
                return Err(missing_step(session, step_index));
            };
            next.context.insert(step.output_key.clone(), output);
            next.steps_completed.push(step.name.clone());
            next.conflicts.extend(conflicts);
            next.current_step_index += 1;
            next.retries_used = 0;
            begin_step(&mut next, definition)
        }

        SessionEvent::StepFailed {
            step_index,
            code,
            message,
        } => {
            if !is_current(session, step_index, SessionStatus::Running) {
                return Ok(Transition::ignore(session));
            }
            let Some(step) = definition.step(step_index) else {
                return Err(missing_step(session, step_index));
            };
            next.error_info = Some(ErrorInfo {
                step: step.name.clone(),
                retry_count: session.retries_used,
                code,
                message,
                at: now,
            });
            if code.is_retryable() && session.retries_used < step.max_retries {
                next.retries_used += 1;
                next.status = SessionStatus::WaitingRetry;
                Directive::Backoff {
                    step_index,
                    retry: next.retries_used,
                }
            } else {
                next.status = SessionStatus::Failed;
                Directive::Finished(SessionStatus::Failed)
            }
        }

        SessionEvent::RetryDue { step_index } => {
            if !is_current(session, step_index, SessionStatus::WaitingRetry) {
                return Ok(Transition::ignore(session));
            }
            next.status = SessionStatus::Running;
            Directive::Dispatch {
                step_index,
                attempt: next.retries_used + 1,
            }
        }

        SessionEvent::Cancel => {
            if session.is_terminal() {
                return Err(invalid(session, "cancel"));
            }
            next.status = SessionStatus::Cancelled;
            Directive::Finished(SessionStatus::Cancelled)
        }

        SessionEvent::ManualRetry { step_name } => {
            if session.status != SessionStatus::Failed {
                return Err(invalid(session, "retry"));
            }
            let current = definition.step(session.current_step_index);
            let failed_here = session
                .error_info
                .as_ref()
                .map(|e| e.step == step_name)
                .unwrap_or(false);
            if current.map(|s| s.name.as_str()) != Some(step_name.as_str()) || !failed_here {
                return Err(Error::InvalidTransition(format!(
                    "session {} did not fail at step '{}'",
                    session.session_id, step_name
                )));
            }
            next.status = SessionStatus::Running;
            next.retries_used = 0;
            Directive::Dispatch {
                step_index: session.current_step_index,
                attempt: 1,
            }
        }

        SessionEvent::Resume => match session.status {
            SessionStatus::Pending => begin_step(&mut next, definition),
            SessionStatus::Running | SessionStatus::WaitingRetry => {
                next.status = SessionStatus::Running;
                Directive::Dispatch {
                    step_index: session.current_step_index,
                    attempt: session.retries_used + 1,
                }
            }
            _ => return Err(invalid(session, "resume")),
        },
    };

    next.updated_at = now;
    Ok(Transition {
        session: next,
        directive,
    })
}

/// Dispatch the step at `current_step_index`, or complete when none is left.
fn begin_step(session: &mut WorkflowSession, definition: &WorkflowDefinition) -> Directive {
    if session.current_step_index >= definition.steps.len() {
        session.status = SessionStatus::Completed;
        return Directive::Finished(SessionStatus::Completed);
    }
    session.status = SessionStatus::Running;
    Directive::Dispatch {
        step_index: session.current_step_index,
        attempt: 1,
    }
}

fn is_current(session: &WorkflowSession, step_index: usize, status: SessionStatus) -> bool {
    session.status == status && session.current_step_index == step_index
}

fn invalid(session: &WorkflowSession, what: &str) -> Error {
    Error::InvalidTransition(format!(
        "cannot {} session {} in state {}",
        what, session.session_id, session.status
    ))
}

fn missing_step(session: &WorkflowSession, step_index: usize) -> Error {
    Error::InvalidTransition(format!(
        "session {} has no step {}",
        session.session_id, step_index
    ))
}
