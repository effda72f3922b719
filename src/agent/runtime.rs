//! Per-agent runtime: the single consumer of an agent's mailbox.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Agent, AgentError, AgentMonitor, AgentState};
use crate::core::bus::MessageBus;
use crate::error::FailureCode;
use crate::protocol::correlation::RecentIds;
use crate::protocol::{
    Envelope, ErrorPayload, MessageKind, Recipient, StatusPayload, TaskPayload,
};

pub(crate) struct RuntimeParts {
    pub agent: Arc<dyn Agent>,
    pub capabilities: BTreeSet<String>,
    pub topics: Arc<parking_lot::RwLock<BTreeSet<String>>>,
    pub cancelled: Arc<parking_lot::Mutex<RecentIds>>,
    pub rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    pub monitor: Arc<AgentMonitor>,
    pub stop: CancellationToken,
    pub close: CancellationToken,
}

enum Next {
    Envelope(Envelope),
    Closing,
    Done,
}

pub(crate) fn spawn(parts: RuntimeParts, bus: Weak<MessageBus>) -> JoinHandle<()> {
    tokio::spawn(run(parts, bus))
}

async fn run(parts: RuntimeParts, bus: Weak<MessageBus>) {
    let agent_id = parts.agent.id().to_string();

    if let Err(e) = parts.agent.on_start().await {
        tracing::error!("Agent {} failed to start: {}", agent_id, e);
        parts.monitor.set_state(AgentState::Error);
    }
    tracing::debug!("Agent {} runtime started", agent_id);

    let mut closing = false;
    loop {
        if parts.stop.is_cancelled() {
            break;
        }

        let next = {
            let mut rx = parts.rx.lock().await;
            let next = tokio::select! {
                biased;
                _ = parts.stop.cancelled() => Next::Done,
                _ = parts.close.cancelled(), if !closing => Next::Closing,
                received = rx.recv() => match received {
                    Some(envelope) => Next::Envelope(envelope),
                    None => Next::Done,
                },
            };
            if matches!(next, Next::Closing) {
                rx.close();
            }
            next
        };

        match next {
            Next::Done => break,
            Next::Closing => {
                tracing::debug!("Agent {} draining its mailbox", agent_id);
                closing = true;
            }
            Next::Envelope(envelope) => {
                let Some(bus) = bus.upgrade() else {
                    break;
                };
                process(&parts, &agent_id, &bus, envelope).await;
            }
        }
    }

    if let Err(e) = parts.agent.on_stop().await {
        tracing::warn!("Agent {} on_stop failed: {}", agent_id, e);
    }
    parts.monitor.set_state(AgentState::Stopped);
    tracing::info!("Agent {} stopped", agent_id);
}

async fn process(parts: &RuntimeParts, agent_id: &str, bus: &MessageBus, envelope: Envelope) {
    match envelope.kind() {
        MessageKind::TaskRequest => handle_task(parts, agent_id, bus, envelope).await,
        MessageKind::Cancel => {
            tracing::debug!(
                "Agent {} got cancel for {}",
                agent_id,
                envelope.correlation_id().unwrap_or("-")
            );
        }
        MessageKind::TaskReply | MessageKind::Error => {
            tracing::warn!("Agent {} dropped stray reply {}", agent_id, envelope.id());
        }
        MessageKind::StatusUpdate | MessageKind::Notification => {
            if let Recipient::Topic(topic) = envelope.recipient() {
                if !parts.topics.read().contains(topic) {
                    tracing::debug!("Agent {} no longer follows {}, skipping", agent_id, topic);
                    return;
                }
            }
            if let Err(e) = invoke(&parts.agent, &envelope).await {
                tracing::warn!("Agent {} failed on {}: {}", agent_id, envelope.kind(), e);
            }
        }
    }
}

async fn handle_task(parts: &RuntimeParts, agent_id: &str, bus: &MessageBus, request: Envelope) {
    let Some(correlation_id) = request.correlation_id().map(str::to_string) else {
        tracing::warn!("Agent {} got request {} without correlation id", agent_id, request.id());
        return;
    };
    if parts.cancelled.lock().contains(&correlation_id) {
        tracing::debug!("Agent {} skipping cancelled request {}", agent_id, correlation_id);
        return;
    }

    let state = parts.monitor.state();
    if !state.is_available() {
        let message = format!("agent {} is {}", agent_id, state);
        reply_error(bus, agent_id, &request, FailureCode::AgentUnavailable, message).await;
        return;
    }

    let task: TaskPayload = match request.decode() {
        Ok(task) => task,
        Err(e) => {
            reply_error(bus, agent_id, &request, FailureCode::InvalidInput, e.to_string()).await;
            return;
        }
    };
    if !parts.capabilities.contains(&task.capability) {
        let message = format!("{} cannot perform {}", agent_id, task.capability);
        reply_error(bus, agent_id, &request, FailureCode::Unsupported, message).await;
        return;
    }

    parts.monitor.set_state(AgentState::Busy);
    publish_state(bus, agent_id, AgentState::Busy, Some(task.capability.as_str()));

    let outcome = match invoke(&parts.agent, &request).await {
        Ok(Some(reply))
            if !reply.kind().is_reply() || reply.correlation_id() != Some(correlation_id.as_str()) =>
        {
            Err(AgentError::Internal(format!(
                "reply {} does not answer {}",
                reply.id(),
                correlation_id
            )))
        }
        other => other,
    };

    let (next_state, reply) = match outcome {
        Ok(Some(reply)) => {
            if reply.kind() == MessageKind::Error {
                parts.monitor.record_failure();
            } else {
                parts.monitor.record_success();
            }
            (AgentState::Idle, Some(reply))
        }
        Ok(None) => {
            tracing::debug!("Agent {} sent no reply for {}", agent_id, correlation_id);
            parts.monitor.record_success();
            (AgentState::Idle, None)
        }
        Err(e) => {
            parts.monitor.record_failure();
            let next_state = if e.is_internal() {
                tracing::error!("Agent {} failed internally: {}", agent_id, e);
                AgentState::Error
            } else {
                tracing::warn!("Agent {} task {} failed: {}", agent_id, task.capability, e);
                AgentState::Idle
            };
            let reply = request
                .error_reply(agent_id, &ErrorPayload::new(e.code(), e.to_string()))
                .ok();
            (next_state, reply)
        }
    };

    // state first so the requester sees this agent free once the reply lands
    if next_state == AgentState::Error {
        parts.monitor.set_state(AgentState::Error);
    } else {
        parts.monitor.transition(AgentState::Busy, next_state);
    }
    publish_state(bus, agent_id, next_state, None);

    if let Some(reply) = reply {
        if let Err(e) = bus.send(reply).await {
            tracing::warn!("Agent {} could not deliver reply: {}", agent_id, e);
        }
    }
}

/// Run `handle` on its own task so a panic cannot take the runtime down.
async fn invoke(agent: &Arc<dyn Agent>, envelope: &Envelope) -> Result<Option<Envelope>, AgentError> {
    let agent = Arc::clone(agent);
    let envelope = envelope.clone();
    match tokio::spawn(async move { agent.handle(&envelope).await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(AgentError::Internal("handler panicked".to_string())),
        Err(e) => Err(AgentError::Internal(e.to_string())),
    }
}

async fn reply_error(
    bus: &MessageBus,
    agent_id: &str,
    request: &Envelope,
    code: FailureCode,
    message: String,
) {
    tracing::debug!("Agent {} rejecting {}: {}", agent_id, request.id(), message);
    match request.error_reply(agent_id, &ErrorPayload::new(code, message)) {
        Ok(reply) => {
            if let Err(e) = bus.send(reply).await {
                tracing::warn!("Agent {} could not deliver error reply: {}", agent_id, e);
            }
        }
        Err(e) => tracing::warn!("Agent {} could not build error reply: {}", agent_id, e),
    }
}

fn publish_state(bus: &MessageBus, agent_id: &str, state: AgentState, detail: Option<&str>) {
    let mut status = StatusPayload::new(agent_id, state);
    if let Some(detail) = detail {
        status = status.with_detail(detail);
    }
    if let Ok(envelope) = Envelope::status(agent_id, &status) {
        bus.publish(envelope);
    }
}
