//! Agent registry: ids to live runtimes, mailboxes and subscriptions.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bus::MessageBus;
use crate::agent::runtime::{self, RuntimeParts};
use crate::agent::{Agent, AgentHandle, AgentMonitor, AgentState};
use crate::error::{Error, Result};
use crate::protocol::correlation::RecentIds;
use crate::protocol::types::TOPIC_PREFIX;
use crate::protocol::{Envelope, Mailbox, Recipient, BROADCAST_ALL};

/// Cancelled correlation ids remembered per agent.
const CANCELLED_WINDOW: usize = 1024;

struct AgentEntry {
    capabilities: BTreeSet<String>,
    topics: Arc<parking_lot::RwLock<BTreeSet<String>>>,
    cancelled: Arc<parking_lot::Mutex<RecentIds>>,
    mailbox: Mailbox,
    monitor: Arc<AgentMonitor>,
    /// Stop right away (replacement)
    stop: CancellationToken,
    /// Finish the queued envelopes, then stop
    close: CancellationToken,
    task: JoinHandle<()>,
}

impl AgentEntry {
    fn snapshot(&self, agent_id: &str) -> AgentHandle {
        AgentHandle {
            agent_id: agent_id.to_string(),
            capabilities: self.capabilities.clone(),
            topics: self.topics.read().clone(),
            state: self.monitor.state(),
            tasks_completed: self.monitor.completed(),
            tasks_failed: self.monitor.failed(),
            mailbox: self.mailbox.stats(),
        }
    }
}

/// Registered agents keyed by id.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
    mailbox_capacity: usize,
    state_changed: Arc<Notify>,
}

impl AgentRegistry {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            mailbox_capacity: mailbox_capacity.max(1),
            state_changed: Arc::new(Notify::new()),
        }
    }

    /// Register `agent`, replacing any runtime already registered under its id.
    ///
    /// On replacement the old runtime is stopped and everything still queued
    /// in its mailbox moves to the new mailbox in order. The swap happens
    /// under the write lock, so no send can resolve the old mailbox after
    /// this returns.
    pub(crate) async fn register(
        &self,
        agent: Arc<dyn Agent>,
        topics: Vec<String>,
        bus: Weak<MessageBus>,
    ) -> Result<AgentHandle> {
        let agent_id = agent.id().to_string();
        validate_id(&agent_id)?;

        let mut agents = self.agents.write().await;
        let previous = agents.remove(&agent_id);
        let carried = previous.as_ref().map(|p| p.mailbox.depth()).unwrap_or(0);

        let mailbox = Mailbox::new(agent_id.clone(), self.mailbox_capacity + carried);
        let capabilities: BTreeSet<String> = agent.capabilities().into_iter().collect();
        let topics = Arc::new(parking_lot::RwLock::new(topics.into_iter().collect()));
        let cancelled = previous
            .as_ref()
            .map(|p| Arc::clone(&p.cancelled))
            .unwrap_or_else(|| Arc::new(parking_lot::Mutex::new(RecentIds::new(CANCELLED_WINDOW))));
        let monitor = Arc::new(AgentMonitor::new(Arc::clone(&self.state_changed)));
        let stop = CancellationToken::new();
        let close = CancellationToken::new();

        let task = runtime::spawn(
            RuntimeParts {
                agent,
                capabilities: capabilities.clone(),
                topics: Arc::clone(&topics),
                cancelled: Arc::clone(&cancelled),
                rx: mailbox.receiver(),
                monitor: Arc::clone(&monitor),
                stop: stop.clone(),
                close: close.clone(),
            },
            bus,
        );

        if let Some(old) = previous {
            old.stop.cancel();
            let moved = old.mailbox.drain_into(&mailbox).await;
            tracing::info!(
                "Replaced agent {} ({} queued envelope(s) carried over)",
                agent_id,
                moved
            );
        } else {
            tracing::info!("Registered agent {} with {:?}", agent_id, capabilities);
        }

        let entry = AgentEntry {
            capabilities,
            topics,
            cancelled,
            mailbox,
            monitor,
            stop,
            close,
            task,
        };
        let handle = entry.snapshot(&agent_id);
        agents.insert(agent_id, entry);
        self.state_changed.notify_waiters();
        Ok(handle)
    }

    /// Remove an agent. Its runtime finishes what is already queued, then stops.
    pub async fn deregister(&self, agent_id: &str) -> Result<AgentHandle> {
        let entry = self
            .agents
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        entry.close.cancel();
        tracing::info!("Deregistered agent {}", agent_id);
        Ok(entry.snapshot(agent_id))
    }

    pub async fn lookup(&self, agent_id: &str) -> Result<AgentHandle> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|e| e.snapshot(agent_id))
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))
    }

    /// Agents declaring `capability`, ordered by id.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<AgentHandle> {
        let agents = self.agents.read().await;
        let mut found: Vec<AgentHandle> = agents
            .iter()
            .filter(|(_, e)| e.capabilities.contains(capability))
            .map(|(id, e)| e.snapshot(id))
            .collect();
        found.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        found
    }

    /// Every registered agent, ordered by id.
    pub async fn agents(&self) -> Vec<AgentHandle> {
        let agents = self.agents.read().await;
        let mut all: Vec<AgentHandle> = agents.iter().map(|(id, e)| e.snapshot(id)).collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    /// Producer side of an agent's mailbox.
    pub(crate) async fn sender(&self, agent_id: &str) -> Result<mpsc::Sender<Envelope>> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|e| e.mailbox.sender())
            .ok_or_else(|| Error::UnknownRecipient(agent_id.to_string()))
    }

    /// Mailboxes a broadcast to `recipient` fans out to, ordered by agent id.
    pub(crate) async fn broadcast_targets(
        &self,
        recipient: &Recipient,
    ) -> Vec<(String, mpsc::Sender<Envelope>)> {
        let agents = self.agents.read().await;
        let mut targets: Vec<(String, mpsc::Sender<Envelope>)> = agents
            .iter()
            .filter(|(_, e)| match recipient {
                Recipient::All => true,
                Recipient::Topic(topic) => e.topics.read().contains(topic),
                Recipient::Agent(_) => false,
            })
            .map(|(id, e)| (id.clone(), e.mailbox.sender()))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        targets
    }

    pub async fn subscribe(&self, agent_id: &str, topic: &str) -> Result<()> {
        let agents = self.agents.read().await;
        let entry = agents
            .get(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        entry.topics.write().insert(topic.to_string());
        tracing::debug!("Agent {} subscribed to {}", agent_id, topic);
        Ok(())
    }

    /// Drop a subscription. Topic broadcasts still queued for the agent are
    /// skipped when dequeued, so nothing on `topic` reaches it after this returns.
    pub async fn unsubscribe(&self, agent_id: &str, topic: &str) -> Result<bool> {
        let agents = self.agents.read().await;
        let entry = agents
            .get(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        let removed = entry.topics.write().remove(topic);
        tracing::debug!("Agent {} unsubscribed from {}", agent_id, topic);
        Ok(removed)
    }

    /// Mark a request as cancelled for `agent_id`; the runtime skips it if still queued.
    pub(crate) async fn mark_cancelled(&self, agent_id: &str, correlation_id: &str) -> Result<()> {
        let agents = self.agents.read().await;
        let entry = agents
            .get(agent_id)
            .ok_or_else(|| Error::UnknownRecipient(agent_id.to_string()))?;
        entry.cancelled.lock().insert(correlation_id.to_string());
        Ok(())
    }

    /// Move an agent from `error` back to `idle`.
    pub async fn reset(&self, agent_id: &str) -> Result<bool> {
        let agents = self.agents.read().await;
        let entry = agents
            .get(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        let reset = entry.monitor.transition(AgentState::Error, AgentState::Idle);
        if reset {
            tracing::info!("Agent {} reset to idle", agent_id);
        }
        Ok(reset)
    }

    /// Notified whenever any agent changes state or registers.
    pub fn state_changed(&self) -> Arc<Notify> {
        Arc::clone(&self.state_changed)
    }

    /// Deregister everyone and return the runtime tasks to await.
    pub(crate) async fn close_all(&self) -> Vec<JoinHandle<()>> {
        let mut agents = self.agents.write().await;
        agents
            .drain()
            .map(|(id, entry)| {
                tracing::debug!("Closing mailbox of {}", id);
                entry.close.cancel();
                entry.task
            })
            .collect()
    }
}

fn validate_id(agent_id: &str) -> Result<()> {
    if agent_id.trim().is_empty() || agent_id == BROADCAST_ALL || agent_id.starts_with(TOPIC_PREFIX) {
        return Err(Error::Config(format!("invalid agent id '{}'", agent_id)));
    }
    Ok(())
}
