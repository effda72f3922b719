//! Pending-reply table matching replies to their requests by correlation ID.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::envelope::Envelope;
use crate::error::{Error, Result};

/// Default number of resolved correlation IDs remembered for duplicate detection.
pub const DEFAULT_DUPLICATE_WINDOW: usize = 4096;

/// What happened to a reply handed to [`PendingReplies::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Handed to the waiting requester
    Delivered,
    /// A reply for this correlation ID was already delivered
    Duplicate,
    /// Nobody is waiting any more (timed out, cancelled or never requested)
    Late,
}

/// Requests awaiting exactly one reply.
#[derive(Debug)]
pub struct PendingReplies {
    waiting: DashMap<String, oneshot::Sender<Envelope>>,
    resolved: Mutex<RecentIds>,
}

impl PendingReplies {
    pub fn new(duplicate_window: usize) -> Self {
        Self {
            waiting: DashMap::new(),
            resolved: Mutex::new(RecentIds::new(duplicate_window)),
        }
    }

    /// Start waiting for the reply to `correlation_id`.
    ///
    /// The entry lives as long as the returned guard; dropping it (timeout or
    /// cancellation of the awaiting task) turns any later reply into a late one.
    pub fn register(self: &Arc<Self>, correlation_id: impl Into<String>) -> Result<PendingReply> {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        match self.waiting.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::InvalidEnvelope(format!(
                    "correlation id {} is already awaiting a reply",
                    correlation_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        Ok(PendingReply {
            correlation_id,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Route a reply envelope to its requester.
    pub fn resolve(&self, envelope: Envelope) -> ReplyOutcome {
        let Some(correlation_id) = envelope.correlation_id().map(str::to_string) else {
            return ReplyOutcome::Late;
        };

        match self.waiting.remove(&correlation_id) {
            Some((_, tx)) => {
                self.resolved.lock().insert(correlation_id);
                if tx.send(envelope).is_ok() {
                    ReplyOutcome::Delivered
                } else {
                    ReplyOutcome::Late
                }
            }
            None if self.resolved.lock().contains(&correlation_id) => ReplyOutcome::Duplicate,
            None => ReplyOutcome::Late,
        }
    }

    /// Number of requests still waiting.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    fn forget(&self, correlation_id: &str) {
        self.waiting.remove(correlation_id);
    }
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_WINDOW)
    }
}

/// Guard for one outstanding request.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: String,
    rx: oneshot::Receiver<Envelope>,
    table: Arc<PendingReplies>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply or fail with a timeout.
    pub async fn wait(mut self, timeout: Duration) -> Result<Envelope> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(Error::Other(format!(
                "reply channel for {} closed",
                self.correlation_id
            ))),
            Err(_) => Err(Error::Timeout {
                correlation_id: self.correlation_id.clone(),
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.forget(&self.correlation_id);
    }
}

/// Bounded FIFO set of recently resolved IDs.
#[derive(Debug)]
pub(crate) struct RecentIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn insert(&mut self, id: String) {
        if !self.set.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{ReplyPayload, TaskPayload};

    fn request() -> Envelope {
        Envelope::request("orchestrator", "pm", &TaskPayload::new("pm.schedule")).unwrap()
    }

    #[tokio::test]
    async fn test_reply_delivered_once() {
        let table = Arc::new(PendingReplies::default());
        let req = request();
        let pending = table.register(req.correlation_id().unwrap()).unwrap();

        let reply = req.reply("pm", &ReplyPayload::new(serde_json::json!("ok"))).unwrap();
        assert_eq!(table.resolve(reply.clone()), ReplyOutcome::Delivered);
        assert_eq!(table.resolve(reply), ReplyOutcome::Duplicate);

        let got = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.correlation_id(), req.correlation_id());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_turns_reply_late() {
        let table = Arc::new(PendingReplies::default());
        let req = request();
        let pending = table.register(req.correlation_id().unwrap()).unwrap();

        let err = pending.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(table.is_empty());

        let reply = req.reply("pm", &ReplyPayload::new(serde_json::json!("late"))).unwrap();
        assert_eq!(table.resolve(reply), ReplyOutcome::Late);
    }

    #[test]
    fn test_dropped_guard_forgets_request() {
        let table = Arc::new(PendingReplies::default());
        let pending = table.register("c-1").unwrap();
        assert!(table.register("c-1").is_err());
        assert_eq!(table.len(), 1);
        drop(pending);
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_register_admits_one() {
        let table = Arc::new(PendingReplies::default());
        let barrier = std::sync::Barrier::new(8);
        let results: Vec<Result<PendingReply>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let table = Arc::clone(&table);
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        table.register("c-shared")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(table.len(), 1);
        drop(results);
        assert!(table.is_empty());
    }

    #[test]
    fn test_recent_ids_bounded() {
        let mut recent = RecentIds::new(2);
        recent.insert("a".to_string());
        recent.insert("b".to_string());
        recent.insert("c".to_string());
        assert!(!recent.contains("a"));
        assert!(recent.contains("b"));
        assert!(recent.contains("c"));
    }
}
