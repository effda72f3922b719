//! Bounded per-agent mailboxes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

use super::envelope::Envelope;

/// Default mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// An agent's inbound queue.
///
/// Any number of producers hold clones of the sender; the owning agent
/// runtime is the single consumer of the receiver.
#[derive(Debug)]
pub struct Mailbox {
    agent_id: String,
    tx: mpsc::Sender<Envelope>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
}

impl Mailbox {
    /// Create a new mailbox for an agent.
    pub fn new(agent_id: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            agent_id: agent_id.into(),
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Producer side. Sending awaits free capacity.
    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.tx.clone()
    }

    /// Consumer side, shared with the owning runtime.
    pub(crate) fn receiver(&self) -> Arc<Mutex<mpsc::Receiver<Envelope>>> {
        Arc::clone(&self.rx)
    }

    /// Envelopes waiting to be consumed.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Close this mailbox and move every queued envelope into `target`, oldest first.
    ///
    /// Producers blocked on a full mailbox get their envelope back as a send
    /// error once it is closed.
    pub async fn drain_into(&self, target: &Mailbox) -> usize {
        let mut rx = self.rx.lock().await;
        rx.close();

        let mut moved = 0;
        while let Ok(envelope) = rx.try_recv() {
            let outcome = match target.tx.try_send(envelope) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(envelope)) => target.tx.send(envelope).await.map_err(|e| e.0),
                Err(TrySendError::Closed(envelope)) => Err(envelope),
            };
            match outcome {
                Ok(()) => moved += 1,
                Err(envelope) => {
                    tracing::warn!(
                        "Mailbox {} closed while draining {} from {}",
                        target.agent_id,
                        envelope.id(),
                        self.agent_id
                    );
                    break;
                }
            }
        }
        moved
    }

    /// Get mailbox statistics.
    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            agent_id: self.agent_id.clone(),
            depth: self.depth(),
            capacity: self.capacity(),
        }
    }
}

/// Mailbox statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxStats {
    pub agent_id: String,
    pub depth: usize,
    pub capacity: usize,
}
