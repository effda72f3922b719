//! Scripted agents for tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{Agent, AgentError};
use crate::protocol::{Envelope, MessageKind, ReplyPayload, TaskPayload};

fn caps(capabilities: &[&str]) -> Vec<String> {
    capabilities.iter().map(|c| c.to_string()).collect()
}

/// Replies with `{"agent": id, "input": <task input>}`.
pub struct EchoAgent {
    id: String,
    capabilities: Vec<String>,
    delay: Duration,
    calls: AtomicU32,
}

impl EchoAgent {
    pub fn new(id: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            capabilities: caps(capabilities),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, AgentError> {
        if envelope.kind() != MessageKind::TaskRequest {
            return Ok(None);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let task: TaskPayload = envelope.decode()?;
        let output = json!({"agent": self.id, "input": Value::Object(task.input)});
        Ok(Some(envelope.reply(&self.id, &ReplyPayload::new(output))?))
    }
}

/// Fails every task, either externally (error reply) or internally (agent → error).
pub struct FailingAgent {
    id: String,
    capabilities: Vec<String>,
    internal: bool,
    calls: AtomicU32,
}

impl FailingAgent {
    pub fn external(id: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            capabilities: caps(capabilities),
            internal: false,
            calls: AtomicU32::new(0),
        }
    }

    pub fn internal(id: &str, capabilities: &[&str]) -> Self {
        Self {
            internal: true,
            ..Self::external(id, capabilities)
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FailingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<Option<Envelope>, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.internal {
            Err(AgentError::Internal(format!("state corrupted on call {}", call)))
        } else {
            Err(AgentError::External(format!("model offline (call {})", call)))
        }
    }
}

/// Stays silent for the first `silent_for` tasks, then echoes.
pub struct SilentAgent {
    inner: EchoAgent,
    silent_for: u32,
    seen: AtomicU32,
}

impl SilentAgent {
    pub fn new(id: &str, capabilities: &[&str], silent_for: u32) -> Self {
        Self {
            inner: EchoAgent::new(id, capabilities),
            silent_for,
            seen: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for SilentAgent {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn capabilities(&self) -> Vec<String> {
        self.inner.capabilities()
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, AgentError> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst);
        if seen < self.silent_for {
            return Ok(None);
        }
        self.inner.handle(envelope).await
    }
}

pub struct PanickingAgent {
    id: String,
    capabilities: Vec<String>,
}

impl PanickingAgent {
    pub fn new(id: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            capabilities: caps(capabilities),
        }
    }
}

#[async_trait]
impl Agent for PanickingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<Option<Envelope>, AgentError> {
        panic!("{} blew up", self.id);
    }
}

/// Answers with a fixed confidence for a fixed target.
pub struct ScoringAgent {
    id: String,
    capabilities: Vec<String>,
    target: String,
    score: f64,
    delay: Duration,
}

impl ScoringAgent {
    pub fn new(id: &str, capability: &str, target: &str, score: f64) -> Self {
        Self {
            id: id.to_string(),
            capabilities: vec![capability.to_string()],
            target: target.to_string(),
            score,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Agent for ScoringAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, AgentError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let output = json!({"asset": format!("{}-pick", self.id), "confidence": self.score});
        let reply = ReplyPayload::new(output)
            .with_target(self.target.clone())
            .with_score(self.score);
        Ok(Some(envelope.reply(&self.id, &reply)?))
    }
}

/// Records every notification payload; echoes task requests.
pub struct RecordingAgent {
    id: String,
    delay: Duration,
    payloads: Mutex<Vec<Value>>,
    tasks: AtomicU32,
    stopped: AtomicBool,
}

impl RecordingAgent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            delay: Duration::ZERO,
            payloads: Mutex::new(Vec::new()),
            tasks: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().clone()
    }

    pub fn tasks_handled(&self) -> u32 {
        self.tasks.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Poll until `count` payloads were recorded or `within` elapses.
    pub async fn wait_for(&self, count: usize, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        while self.payloads.lock().len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["record".to_string()]
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, AgentError> {
        if envelope.kind() == MessageKind::TaskRequest {
            self.tasks.fetch_add(1, Ordering::SeqCst);
            let reply = ReplyPayload::new(json!("recorded"));
            return Ok(Some(envelope.reply(&self.id, &reply)?));
        }
        self.payloads.lock().push(envelope.payload().clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(None)
    }

    async fn on_stop(&self) -> Result<(), AgentError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}
