//! In-process message bus.
//!
//! Routes envelopes to agent mailboxes, fans broadcasts out, and matches
//! replies to pending requests by correlation id. One bus instance is built
//! at startup and shared by every agent runtime and the orchestrator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::mpsc::error::SendError;
use tokio_stream::wrappers::BroadcastStream;

use super::registry::AgentRegistry;
use crate::agent::{Agent, AgentHandle};
use crate::config::BusSettings;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, MessageKind, PendingReplies, Recipient, ReplyOutcome};

pub struct MessageBus {
    registry: AgentRegistry,
    pending: Arc<PendingReplies>,
    notifications: broadcast::Sender<Envelope>,
}

impl MessageBus {
    pub fn new(settings: &BusSettings) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(settings.notification_capacity.max(1));
        Arc::new(Self {
            registry: AgentRegistry::new(settings.mailbox_capacity),
            pending: Arc::new(PendingReplies::new(settings.duplicate_window)),
            notifications,
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Register (or replace) an agent and start its runtime.
    pub async fn register_agent(
        self: &Arc<Self>,
        agent: Arc<dyn Agent>,
        topics: Vec<String>,
    ) -> Result<AgentHandle> {
        self.registry
            .register(agent, topics, Arc::downgrade(self))
            .await
    }

    pub async fn deregister_agent(&self, agent_id: &str) -> Result<AgentHandle> {
        self.registry.deregister(agent_id).await
    }

    /// Fire-and-forget delivery.
    ///
    /// Replies are matched to their pending request; addressed envelopes wait
    /// for mailbox capacity; broadcasts go to every matching mailbox and to the
    /// notification stream.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if envelope.kind().is_reply() {
            self.resolve_reply(envelope);
            return Ok(());
        }

        match envelope.recipient().clone() {
            Recipient::Agent(agent_id) if envelope.kind() == MessageKind::Cancel => {
                let correlation_id = envelope.correlation_id().ok_or_else(|| {
                    Error::InvalidEnvelope("cancel without correlation id".to_string())
                })?;
                self.registry.mark_cancelled(&agent_id, correlation_id).await?;
                self.deliver(&agent_id, envelope).await
            }
            Recipient::Agent(agent_id) => self.deliver(&agent_id, envelope).await,
            recipient => {
                if !envelope.kind().is_broadcastable() {
                    return Err(Error::InvalidEnvelope(format!(
                        "{} envelopes cannot be broadcast",
                        envelope.kind()
                    )));
                }
                self.fan_out(&recipient, envelope).await;
                Ok(())
            }
        }
    }

    /// Send a `task_request` and wait for its reply.
    ///
    /// The whole exchange (including waiting for mailbox capacity) is bounded
    /// by `timeout`. The protocol layer never retries.
    pub async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        if envelope.kind() != MessageKind::TaskRequest {
            return Err(Error::InvalidEnvelope(format!(
                "request() needs a task_request, got {}",
                envelope.kind()
            )));
        }
        let Some(agent_id) = envelope.recipient().agent_id().map(str::to_string) else {
            return Err(Error::InvalidEnvelope(
                "requests cannot be broadcast".to_string(),
            ));
        };
        let correlation_id = envelope
            .correlation_id()
            .ok_or_else(|| Error::InvalidEnvelope("request without correlation id".to_string()))?
            .to_string();

        let started = Instant::now();
        let pending = self.pending.register(correlation_id.clone())?;

        match tokio::time::timeout(timeout, self.deliver(&agent_id, envelope)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    correlation_id,
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        pending.wait(remaining).await.map_err(|e| match e {
            Error::Timeout { correlation_id, .. } => Error::Timeout {
                correlation_id,
                after_ms: timeout.as_millis() as u64,
            },
            other => other,
        })
    }

    /// Live stream of status updates and broadcast notifications.
    pub fn subscribe_notifications(&self) -> BroadcastStream<Envelope> {
        BroadcastStream::new(self.notifications.subscribe())
    }

    /// Raw receiver for the notification stream.
    pub fn notifications(&self) -> broadcast::Receiver<Envelope> {
        self.notifications.subscribe()
    }

    /// Put an envelope on the notification stream only.
    pub(crate) fn publish(&self, envelope: Envelope) {
        // no receivers is fine
        let _ = self.notifications.send(envelope);
    }

    pub async fn subscribe(&self, agent_id: &str, topic: &str) -> Result<()> {
        self.registry.subscribe(agent_id, topic).await
    }

    pub async fn unsubscribe(&self, agent_id: &str, topic: &str) -> Result<bool> {
        self.registry.unsubscribe(agent_id, topic).await
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Close every mailbox and wait for the agents to drain them.
    pub async fn shutdown(&self) {
        let tasks = self.registry.close_all().await;
        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Agent runtime ended abnormally: {}", e);
            }
        }
        tracing::info!("Message bus stopped ({} agent(s) drained)", count);
    }

    fn resolve_reply(&self, envelope: Envelope) {
        let id = envelope.id().to_string();
        let correlation_id = envelope.correlation_id().unwrap_or("-").to_string();
        let sender = envelope.sender().to_string();
        match self.pending.resolve(envelope) {
            ReplyOutcome::Delivered => {
                tracing::debug!("Reply {} from {} matched {}", id, sender, correlation_id)
            }
            ReplyOutcome::Duplicate => tracing::warn!(
                "Discarding duplicate reply {} from {} for {}",
                id,
                sender,
                correlation_id
            ),
            ReplyOutcome::Late => tracing::debug!(
                "Discarding late reply {} from {} for {}",
                id,
                sender,
                correlation_id
            ),
        }
    }

    async fn deliver(&self, agent_id: &str, envelope: Envelope) -> Result<()> {
        let sender = self.registry.sender(agent_id).await?;
        tracing::debug!("Routing {} {} to {}", envelope.kind(), envelope.id(), agent_id);
        match sender.send(envelope).await {
            Ok(()) => Ok(()),
            Err(SendError(envelope)) => {
                // mailbox closed under us: the agent was replaced or is going away
                let sender = self.registry.sender(agent_id).await?;
                sender
                    .send(envelope)
                    .await
                    .map_err(|_| Error::AgentUnavailable(agent_id.to_string()))
            }
        }
    }

    async fn fan_out(&self, recipient: &Recipient, envelope: Envelope) {
        let targets = self.registry.broadcast_targets(recipient).await;
        tracing::debug!(
            "Broadcasting {} {} to {} agent(s)",
            envelope.kind(),
            envelope.id(),
            targets.len()
        );
        for (agent_id, sender) in targets {
            if sender.send(envelope.clone()).await.is_err() {
                tracing::debug!("Skipping broadcast to closed mailbox of {}", agent_id);
            }
        }
        self.publish(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{EchoAgent, FailingAgent, PanickingAgent, RecordingAgent, SilentAgent};
    use crate::agent::AgentState;
    use crate::error::FailureCode;
    use crate::protocol::{ErrorPayload, ReplyPayload, TaskPayload};
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn bus() -> Arc<MessageBus> {
        MessageBus::new(&BusSettings::default())
    }

    fn task(capability: &str) -> TaskPayload {
        TaskPayload::new(capability).with_input("text", json!("hello"))
    }

    #[tokio::test]
    async fn test_request_reply_correlation() {
        let bus = bus();
        bus.register_agent(Arc::new(EchoAgent::new("echo", &["echo"])), vec![])
            .await
            .unwrap();

        for _ in 0..5 {
            let req = Envelope::request("tester", "echo", &task("echo")).unwrap();
            let reply = bus.request(req.clone(), Duration::from_secs(1)).await.unwrap();
            assert_eq!(reply.correlation_id(), req.correlation_id());
            assert_eq!(reply.kind(), MessageKind::TaskReply);
            assert_eq!(reply.recipient(), &Recipient::Agent("tester".to_string()));
        }
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_unknown_recipient_fails_fast() {
        let bus = bus();
        let req = Envelope::request("tester", "ghost", &task("echo")).unwrap();
        let err = bus.send(req.clone()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownRecipient(_)));
        let err = bus.request(req, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::UnknownRecipient(_)));
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out_and_late_reply_is_dropped() {
        let bus = bus();
        let silent = Arc::new(SilentAgent::new("mute", &["echo"], 1));
        bus.register_agent(silent, vec![]).await.unwrap();

        let req = Envelope::request("tester", "mute", &task("echo")).unwrap();
        let err = bus.request(req.clone(), Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.failure_code(), FailureCode::Timeout);

        let late = req.reply("mute", &ReplyPayload::new(json!("late"))).unwrap();
        bus.send(late).await.unwrap();
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_reply_is_discarded() {
        let bus = bus();
        let req = Envelope::request("tester", "nobody", &task("echo")).unwrap();
        let pending = bus.pending.register(req.correlation_id().unwrap()).unwrap();

        let reply = req.reply("nobody", &ReplyPayload::new(json!(1))).unwrap();
        bus.send(reply.clone()).await.unwrap();
        bus.send(reply).await.unwrap();

        let got = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.correlation_id(), req.correlation_id());
    }

    #[tokio::test]
    async fn test_request_rejects_broadcast() {
        let bus = bus();
        let env = Envelope::broadcast("tester", json!({"note": "hi"}));
        assert!(bus.request(env, Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_per_recipient_fifo_with_interleaved_producers() {
        let bus = bus();
        let recorder = Arc::new(RecordingAgent::new("sink"));
        bus.register_agent(recorder.clone(), vec![]).await.unwrap();

        let mut producers = Vec::new();
        for producer in 0..4 {
            let bus = Arc::clone(&bus);
            producers.push(tokio::spawn(async move {
                for seq in 0..50 {
                    let env = Envelope::notify(
                        format!("p{}", producer),
                        Recipient::Agent("sink".to_string()),
                        MessageKind::Notification,
                        json!({"producer": producer, "seq": seq}),
                    );
                    bus.send(env).await.unwrap();
                }
            }));
        }
        for p in producers {
            p.await.unwrap();
        }
        recorder.wait_for(200, Duration::from_secs(2)).await;

        let seen = recorder.payloads();
        for producer in 0..4 {
            let seqs: Vec<i64> = seen
                .iter()
                .filter(|p| p["producer"] == json!(producer))
                .map(|p| p["seq"].as_i64().unwrap())
                .collect();
            assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_backpressure_blocks_instead_of_dropping() {
        let settings = BusSettings {
            mailbox_capacity: 2,
            ..BusSettings::default()
        };
        let bus = MessageBus::new(&settings);
        let recorder = Arc::new(RecordingAgent::new("sink").with_delay(Duration::from_millis(20)));
        bus.register_agent(recorder.clone(), vec![]).await.unwrap();

        for seq in 0..10 {
            let env = Envelope::notify(
                "p",
                Recipient::Agent("sink".to_string()),
                MessageKind::Notification,
                json!({"seq": seq}),
            );
            bus.send(env).await.unwrap();
        }
        recorder.wait_for(10, Duration::from_secs(2)).await;
        assert_eq!(recorder.payloads().len(), 10);
    }

    #[tokio::test]
    async fn test_broadcast_and_topics() {
        let bus = bus();
        let a = Arc::new(RecordingAgent::new("a"));
        let b = Arc::new(RecordingAgent::new("b"));
        bus.register_agent(a.clone(), vec!["progress".to_string()]).await.unwrap();
        bus.register_agent(b.clone(), vec![]).await.unwrap();
        let mut stream = bus.subscribe_notifications();

        bus.send(Envelope::broadcast("tester", json!({"n": 1}))).await.unwrap();
        let topic = Envelope::notify(
            "tester",
            Recipient::Topic("progress".to_string()),
            MessageKind::Notification,
            json!({"n": 2}),
        );
        bus.send(topic).await.unwrap();

        a.wait_for(2, Duration::from_secs(1)).await;
        b.wait_for(1, Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(a.payloads().len(), 2);
        assert_eq!(b.payloads(), vec![json!({"n": 1})]);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload(), &json!({"n": 1}));

        let bad = Envelope::notify("tester", Recipient::All, MessageKind::Cancel, json!(null));
        assert!(bus.send(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = bus();
        let a = Arc::new(RecordingAgent::new("a"));
        bus.register_agent(a.clone(), vec!["progress".to_string()]).await.unwrap();
        assert!(bus.unsubscribe("a", "progress").await.unwrap());

        let topic = Envelope::notify(
            "tester",
            Recipient::Topic("progress".to_string()),
            MessageKind::Notification,
            json!({"n": 1}),
        );
        bus.send(topic).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_external_failure_becomes_error_reply() {
        let bus = bus();
        let failing = Arc::new(FailingAgent::external("flaky", &["echo"]));
        bus.register_agent(failing.clone(), vec![]).await.unwrap();

        let req = Envelope::request("tester", "flaky", &task("echo")).unwrap();
        let reply = bus.request(req, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.kind(), MessageKind::Error);
        let error: ErrorPayload = reply.decode().unwrap();
        assert_eq!(error.code, FailureCode::ExternalDependency);

        // the agent keeps serving
        let handle = bus.registry().lookup("flaky").await.unwrap();
        assert_eq!(handle.state, AgentState::Idle);
        assert_eq!(handle.tasks_failed, 1);
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_isolated_and_agent_rejects_until_reset() {
        let bus = bus();
        bus.register_agent(Arc::new(PanickingAgent::new("boom", &["echo"])), vec![])
            .await
            .unwrap();
        bus.register_agent(Arc::new(EchoAgent::new("echo", &["echo"])), vec![])
            .await
            .unwrap();

        let req = Envelope::request("tester", "boom", &task("echo")).unwrap();
        let reply = bus.request(req, Duration::from_secs(1)).await.unwrap();
        let error: ErrorPayload = reply.decode().unwrap();
        assert_eq!(error.code, FailureCode::Internal);
        assert_eq!(bus.registry().lookup("boom").await.unwrap().state, AgentState::Error);

        let req = Envelope::request("tester", "boom", &task("echo")).unwrap();
        let reply = bus.request(req, Duration::from_secs(1)).await.unwrap();
        let error: ErrorPayload = reply.decode().unwrap();
        assert_eq!(error.code, FailureCode::AgentUnavailable);

        // other agents are unaffected
        let req = Envelope::request("tester", "echo", &task("echo")).unwrap();
        let reply = bus.request(req, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.kind(), MessageKind::TaskReply);

        assert!(bus.registry().reset("boom").await.unwrap());
        assert_eq!(bus.registry().lookup("boom").await.unwrap().state, AgentState::Idle);
    }

    #[tokio::test]
    async fn test_unsupported_capability() {
        let bus = bus();
        bus.register_agent(Arc::new(EchoAgent::new("echo", &["echo"])), vec![])
            .await
            .unwrap();
        let req = Envelope::request("tester", "echo", &task("paint")).unwrap();
        let reply = bus.request(req, Duration::from_secs(1)).await.unwrap();
        let error: ErrorPayload = reply.decode().unwrap();
        assert_eq!(error.code, FailureCode::Unsupported);
    }

    #[tokio::test]
    async fn test_queued_cancel_skips_request() {
        let bus = bus();
        let recorder = Arc::new(RecordingAgent::new("sink").with_delay(Duration::from_millis(50)));
        bus.register_agent(recorder.clone(), vec![]).await.unwrap();

        // keep the agent busy so the next two envelopes queue up
        bus.send(Envelope::notify(
            "tester",
            Recipient::Agent("sink".to_string()),
            MessageKind::Notification,
            json!({"n": 0}),
        ))
        .await
        .unwrap();
        let req = Envelope::request("tester", "sink", &task("record")).unwrap();
        bus.send(req.clone()).await.unwrap();
        bus.send(Envelope::cancel("tester", "sink", req.correlation_id().unwrap()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.tasks_handled(), 0);
    }

    #[tokio::test]
    async fn test_reregistration_drains_queued_messages() {
        let bus = bus();
        let old = Arc::new(RecordingAgent::new("sink").with_delay(Duration::from_millis(100)));
        bus.register_agent(old.clone(), vec![]).await.unwrap();

        for seq in 0..5 {
            bus.send(Envelope::notify(
                "p",
                Recipient::Agent("sink".to_string()),
                MessageKind::Notification,
                json!({"seq": seq}),
            ))
            .await
            .unwrap();
        }

        let new = Arc::new(RecordingAgent::new("sink"));
        bus.register_agent(new.clone(), vec![]).await.unwrap();
        for seq in 5..8 {
            bus.send(Envelope::notify(
                "p",
                Recipient::Agent("sink".to_string()),
                MessageKind::Notification,
                json!({"seq": seq}),
            ))
            .await
            .unwrap();
        }

        new.wait_for(7, Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut seen: Vec<i64> = old
            .payloads()
            .iter()
            .chain(new.payloads().iter())
            .map(|p| p["seq"].as_i64().unwrap())
            .collect();
        let new_seqs: Vec<i64> = new.payloads().iter().map(|p| p["seq"].as_i64().unwrap()).collect();
        let mut sorted = new_seqs.clone();
        sorted.sort();
        assert_eq!(new_seqs, sorted);
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shutdown_drains_before_stop() {
        let bus = bus();
        let recorder = Arc::new(RecordingAgent::new("sink").with_delay(Duration::from_millis(10)));
        bus.register_agent(recorder.clone(), vec![]).await.unwrap();
        for seq in 0..5 {
            bus.send(Envelope::notify(
                "p",
                Recipient::Agent("sink".to_string()),
                MessageKind::Notification,
                json!({"seq": seq}),
            ))
            .await
            .unwrap();
        }
        bus.shutdown().await;
        assert_eq!(recorder.payloads().len(), 5);
        assert!(recorder.stopped());
        assert!(bus.registry().agents().await.is_empty());
    }
}
