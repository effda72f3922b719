//! Supervisor daemon: resets agents that stay faulted.
//!
//! An agent whose handler failed internally sits in `error` and rejects new
//! work. The supervisor scans the registry on an interval and moves agents
//! back to `idle` once they have been in `error` for the configured cooldown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentState;
use crate::config::SupervisorSettings;
use crate::core::bus::MessageBus;

pub struct Supervisor {
    bus: Arc<MessageBus>,
    reset_after: Duration,
    scan_interval: Duration,
    running: CancellationToken,
}

impl Supervisor {
    pub fn new(bus: Arc<MessageBus>, settings: &SupervisorSettings) -> Self {
        Self {
            bus,
            reset_after: Duration::from_secs(settings.reset_after_secs),
            scan_interval: Duration::from_millis(settings.scan_interval_ms.max(1)),
            running: CancellationToken::new(),
        }
    }

    pub fn with_reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = reset_after;
        self
    }

    /// Run until [`Supervisor::stop`] is called.
    pub async fn run(&self) {
        tracing::info!(
            "Supervisor started (reset after {}s, scan every {}ms)",
            self.reset_after.as_secs(),
            self.scan_interval.as_millis()
        );

        let mut faulted = HashMap::new();
        loop {
            tokio::select! {
                _ = self.running.cancelled() => break,
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
            let reset = self.scan(&mut faulted).await;
            if !reset.is_empty() {
                tracing::info!("Supervisor reset {}", reset.join(", "));
            }
        }

        tracing::info!("Supervisor stopped");
    }

    pub fn stop(&self) {
        self.running.cancel();
    }

    /// One pass over the registry. `faulted` remembers when each agent was
    /// first seen in `error`; returns the ids that were reset.
    pub async fn scan(&self, faulted: &mut HashMap<String, Instant>) -> Vec<String> {
        let now = Instant::now();
        let registry = self.bus.registry();
        let agents = registry.agents().await;

        faulted.retain(|id, _| {
            agents
                .iter()
                .any(|a| &a.agent_id == id && a.state == AgentState::Error)
        });

        let mut reset = Vec::new();
        for agent in agents.iter().filter(|a| a.state == AgentState::Error) {
            let since = *faulted.entry(agent.agent_id.clone()).or_insert(now);
            if now.duration_since(since) < self.reset_after {
                continue;
            }
            match registry.reset(&agent.agent_id).await {
                Ok(true) => {
                    faulted.remove(&agent.agent_id);
                    reset.push(agent.agent_id.clone());
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Supervisor could not reset {}: {}", agent.agent_id, e),
            }
        }
        reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::FailingAgent;
    use crate::config::BusSettings;
    use crate::protocol::{Envelope, TaskPayload};

    async fn faulted_bus() -> Arc<MessageBus> {
        let bus = MessageBus::new(&BusSettings::default());
        bus.register_agent(Arc::new(FailingAgent::internal("broken", &["render"])), vec![])
            .await
            .unwrap();
        let request = Envelope::request("tester", "broken", &TaskPayload::new("render")).unwrap();
        let reply = bus.request(request, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.kind(), crate::protocol::MessageKind::Error);
        assert_eq!(
            bus.registry().lookup("broken").await.unwrap().state,
            AgentState::Error
        );
        bus
    }

    #[tokio::test]
    async fn test_scan_waits_for_cooldown() {
        let bus = faulted_bus().await;
        let supervisor = Supervisor::new(Arc::clone(&bus), &SupervisorSettings::default())
            .with_reset_after(Duration::from_secs(3600));
        let mut faulted = HashMap::new();

        assert!(supervisor.scan(&mut faulted).await.is_empty());
        assert!(faulted.contains_key("broken"));
        assert_eq!(
            bus.registry().lookup("broken").await.unwrap().state,
            AgentState::Error
        );
    }

    #[tokio::test]
    async fn test_run_resets_faulted_agent() {
        let bus = faulted_bus().await;
        let settings = SupervisorSettings {
            enabled: true,
            reset_after_secs: 0,
            scan_interval_ms: 10,
        };
        let supervisor = Arc::new(Supervisor::new(Arc::clone(&bus), &settings));
        let task = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.run().await })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while bus.registry().lookup("broken").await.unwrap().state != AgentState::Idle {
            assert!(Instant::now() < deadline, "agent never reset");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        supervisor.stop();
        task.await.unwrap();
    }
}
