//! Workflow orchestrator (the director role).
//!
//! Owns every live [`WorkflowSession`] and is the only writer of session
//! state. Each running session has one driver task that carries out the
//! [`Directive`]s returned by [`advance`]: dispatch a step over the bus,
//! wait out a retry backoff, or stop. Every transition is checkpointed to the
//! [`SessionStore`]; finished sessions leave the live table and are served
//! from the store afterwards.

pub mod conflict;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentHandle, AgentState};
use crate::config::OrchestratorSettings;
use crate::core::bus::MessageBus;
use crate::error::{Error, FailureCode, Result};
use crate::protocol::{
    Envelope, ErrorPayload, MessageKind, ProgressPayload, Recipient, ReplyPayload, TaskPayload,
};
use crate::services::{KeywordSearch, SessionStore, VectorSearch};
use crate::workflow::{
    advance, catalog, Backoff, Directive, SessionEvent, SessionStatus, StepDefinition,
    Transition, WorkflowDefinition, WorkflowSession, WorkflowType,
};

pub use conflict::{
    resolve, resolve_step, score_candidates, Candidate, ConflictRecord, ResolutionReason,
    ScoringRule, TieBreak,
};

/// A live session plus the bookkeeping its driver needs.
struct SessionSlot {
    session: WorkflowSession,
    /// correlation id -> agent id of requests not yet answered
    in_flight: HashMap<String, String>,
    /// Steps each agent executed for this session
    load: HashMap<String, u32>,
    driver: CancellationToken,
}

impl SessionSlot {
    fn new(session: WorkflowSession, driver: CancellationToken) -> Self {
        Self {
            session,
            in_flight: HashMap::new(),
            load: HashMap::new(),
            driver,
        }
    }
}

type SharedSlot = Arc<Mutex<SessionSlot>>;

/// Why a step attempt failed.
#[derive(Debug)]
struct StepFailure {
    code: FailureCode,
    message: String,
}

impl From<Error> for StepFailure {
    fn from(e: Error) -> Self {
        Self {
            code: e.failure_code(),
            message: e.to_string(),
        }
    }
}

struct Inner {
    bus: Arc<MessageBus>,
    definitions: HashMap<WorkflowType, WorkflowDefinition>,
    sessions: parking_lot::Mutex<HashMap<String, SharedSlot>>,
    store: Arc<dyn SessionStore>,
    search: Arc<dyn VectorSearch>,
    backoff: Backoff,
    orchestrator_id: String,
    changed: Notify,
    closed: CancellationToken,
}

/// Builds an [`Orchestrator`] from the built-in catalog plus overrides.
pub struct OrchestratorBuilder {
    bus: Arc<MessageBus>,
    store: Arc<dyn SessionStore>,
    search: Arc<dyn VectorSearch>,
    definitions: HashMap<WorkflowType, WorkflowDefinition>,
    backoff: Backoff,
    deadline: Duration,
    orchestrator_id: String,
}

impl OrchestratorBuilder {
    pub fn settings(mut self, settings: &OrchestratorSettings) -> Self {
        self.backoff = settings.backoff();
        self.deadline = settings.workflow_deadline();
        self.orchestrator_id = settings.orchestrator_id.clone();
        self
    }

    pub fn search(mut self, search: Arc<dyn VectorSearch>) -> Self {
        self.search = search;
        self
    }

    /// Replace the definition registered for `definition.workflow_type`.
    pub fn definition(mut self, definition: WorkflowDefinition) -> Self {
        self.definitions.insert(definition.workflow_type, definition);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        for definition in self.definitions.values() {
            definition.validate(Some(self.deadline))?;
        }
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                bus: self.bus,
                definitions: self.definitions,
                sessions: parking_lot::Mutex::new(HashMap::new()),
                store: self.store,
                search: self.search,
                backoff: self.backoff,
                orchestrator_id: self.orchestrator_id,
                changed: Notify::new(),
                closed: CancellationToken::new(),
            }),
        })
    }
}

/// Starts, advances, cancels and retries workflow sessions.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(bus: Arc<MessageBus>, store: Arc<dyn SessionStore>) -> OrchestratorBuilder {
        let settings = OrchestratorSettings::default();
        OrchestratorBuilder {
            bus,
            store,
            search: Arc::new(KeywordSearch::new()),
            definitions: catalog(),
            backoff: settings.backoff(),
            deadline: settings.workflow_deadline(),
            orchestrator_id: settings.orchestrator_id,
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    /// Registered definitions in catalog order.
    pub fn definitions(&self) -> Vec<&WorkflowDefinition> {
        WorkflowType::ALL
            .iter()
            .filter_map(|t| self.inner.definitions.get(t))
            .collect()
    }

    /// Create a session and start driving its first step.
    pub async fn start_workflow(
        &self,
        workflow_type: WorkflowType,
        initial_context: Map<String, Value>,
    ) -> Result<String> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let definition = inner.definition(workflow_type)?;

        let session = WorkflowSession::new(workflow_type, initial_context);
        let session_id = session.session_id.clone();
        let transition = advance(&session, definition, SessionEvent::Start, Utc::now())?;

        let slot = Arc::new(Mutex::new(SessionSlot::new(session, inner.closed.child_token())));
        let mut state = slot.lock().await;
        let token = state.driver.clone();
        let directive = inner.commit(&slot, &mut state, transition).await;
        drop(state);

        tracing::info!("Started {} session {}", workflow_type, session_id);
        inner.spawn_driver(session_id.clone(), directive, token);
        Ok(session_id)
    }

    /// Read-only copy of a session.
    pub async fn get_status(&self, session_id: &str) -> Result<WorkflowSession> {
        if let Some(slot) = self.inner.live(session_id) {
            return Ok(slot.lock().await.session.clone());
        }
        self.inner
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))
    }

    /// Cancel a non-terminal session. Returns false when it already finished.
    pub async fn cancel_workflow(&self, session_id: &str) -> Result<bool> {
        let inner = &self.inner;
        let slot = inner.slot(session_id).await?;
        let mut state = slot.lock().await;
        let definition = inner.definition(state.session.workflow_type)?;

        let transition = match advance(&state.session, definition, SessionEvent::Cancel, Utc::now()) {
            Ok(transition) => transition,
            Err(Error::InvalidTransition(reason)) => {
                tracing::debug!("Cancel of {} refused: {}", session_id, reason);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        state.driver.cancel();
        let in_flight: Vec<(String, String)> = state.in_flight.drain().collect();
        inner.commit(&slot, &mut state, transition).await;
        drop(state);

        for (correlation_id, agent_id) in in_flight {
            let cancel = Envelope::cancel(&inner.orchestrator_id, &agent_id, &correlation_id);
            if let Err(e) = inner.bus.send(cancel).await {
                tracing::debug!("Cancel for {} not delivered: {}", correlation_id, e);
            }
        }
        tracing::info!("Cancelled session {}", session_id);
        Ok(true)
    }

    /// Resume a failed session from the step that failed.
    pub async fn retry_step(&self, session_id: &str, step_name: &str) -> Result<bool> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let slot = inner.slot(session_id).await?;
        let mut state = slot.lock().await;
        let definition = inner.definition(state.session.workflow_type)?;

        let event = SessionEvent::ManualRetry {
            step_name: step_name.to_string(),
        };
        let transition = match advance(&state.session, definition, event, Utc::now()) {
            Ok(transition) => transition,
            Err(Error::InvalidTransition(reason)) => {
                tracing::debug!("Retry of {} refused: {}", session_id, reason);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        state.driver = inner.closed.child_token();
        let token = state.driver.clone();
        let directive = inner.commit(&slot, &mut state, transition).await;
        drop(state);

        tracing::info!("Retrying step {} of session {}", step_name, session_id);
        inner.spawn_driver(session_id.to_string(), directive, token);
        Ok(true)
    }

    /// Every known session, live or stored, oldest first.
    pub async fn list_sessions(&self) -> Result<Vec<WorkflowSession>> {
        let mut by_id: BTreeMap<String, WorkflowSession> = self
            .inner
            .store
            .list_sessions()
            .await?
            .into_iter()
            .map(|s| (s.session_id.clone(), s))
            .collect();

        let live: Vec<SharedSlot> = self.inner.sessions.lock().values().cloned().collect();
        for slot in live {
            let session = slot.lock().await.session.clone();
            by_id.insert(session.session_id.clone(), session);
        }

        let mut sessions: Vec<WorkflowSession> = by_id.into_values().collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    /// Reload interrupted sessions from the store and re-issue their current step.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let mut resumed = Vec::new();

        for session in inner.store.list_sessions().await? {
            if !matches!(session.status, SessionStatus::Running | SessionStatus::WaitingRetry) {
                continue;
            }
            if inner.live(&session.session_id).is_some() {
                continue;
            }
            let session_id = session.session_id.clone();
            let definition = match inner.definition(session.workflow_type) {
                Ok(definition) => definition,
                Err(e) => {
                    tracing::warn!("Cannot recover session {}: {}", session_id, e);
                    continue;
                }
            };
            let transition = match advance(&session, definition, SessionEvent::Resume, Utc::now()) {
                Ok(transition) => transition,
                Err(e) => {
                    tracing::warn!("Cannot recover session {}: {}", session_id, e);
                    continue;
                }
            };

            let step = session.current_step_index;
            let slot = Arc::new(Mutex::new(SessionSlot::new(session, inner.closed.child_token())));
            let mut state = slot.lock().await;
            let token = state.driver.clone();
            let directive = inner.commit(&slot, &mut state, transition).await;
            drop(state);

            tracing::info!("Recovered session {} at step {}", session_id, step);
            inner.spawn_driver(session_id.clone(), directive, token);
            resumed.push(session_id);
        }
        Ok(resumed)
    }

    /// Wait until the session is terminal or `timeout` elapses.
    pub async fn wait_for(&self, session_id: &str, timeout: Duration) -> Result<WorkflowSession> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let session = self.get_status(session_id).await?;
            if session.is_terminal() {
                return Ok(session);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout {
                    correlation_id: session_id.to_string(),
                    after_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Stop every driver and checkpoint the sessions still in progress.
    ///
    /// Interrupted sessions stay `running`/`waiting_retry` in the store and
    /// are picked up by [`Orchestrator::recover`].
    pub async fn shutdown(&self) {
        self.inner.closed.cancel();
        let live: Vec<SharedSlot> = self.inner.sessions.lock().values().cloned().collect();
        let mut checkpointed = 0;
        for slot in live {
            let state = slot.lock().await;
            if !state.session.is_terminal() && self.inner.checkpoint(&state.session).await {
                checkpointed += 1;
            }
        }
        tracing::info!("Orchestrator stopped, {} session(s) checkpointed", checkpointed);
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Other("orchestrator is shut down".to_string()));
        }
        Ok(())
    }

    fn definition(&self, workflow_type: WorkflowType) -> Result<&WorkflowDefinition> {
        self.definitions
            .get(&workflow_type)
            .ok_or_else(|| Error::NotFound(format!("workflow definition {}", workflow_type)))
    }

    fn live(&self, session_id: &str) -> Option<SharedSlot> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Live slot, or a detached one loaded from the store.
    async fn slot(&self, session_id: &str) -> Result<SharedSlot> {
        if let Some(slot) = self.live(session_id) {
            return Ok(slot);
        }
        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;
        Ok(Arc::new(Mutex::new(SessionSlot::new(
            session,
            self.closed.child_token(),
        ))))
    }

    async fn checkpoint(&self, session: &WorkflowSession) -> bool {
        match self.store.save_session(session).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to checkpoint session {}: {}", session.session_id, e);
                false
            }
        }
    }

    /// Install a transition computed under the slot lock.
    ///
    /// Terminal sessions that reached the store leave the live table.
    async fn commit(&self, slot: &SharedSlot, state: &mut SessionSlot, transition: Transition) -> Directive {
        let before = state.session.status;
        state.session = transition.session;
        let session = &state.session;

        if before != session.status {
            tracing::info!("Session {}: {} -> {}", session.session_id, before, session.status);
        }
        if session.status == SessionStatus::Failed {
            if let Some(error) = &session.error_info {
                tracing::error!(
                    "Session {} failed at step {} after {} retries: {} ({})",
                    session.session_id,
                    error.step,
                    error.retry_count,
                    error.message,
                    error.code
                );
            }
        }

        let saved = self.checkpoint(session).await;
        {
            let mut sessions = self.sessions.lock();
            if session.is_terminal() && saved {
                sessions.remove(&session.session_id);
            } else {
                sessions.insert(session.session_id.clone(), Arc::clone(slot));
            }
        }
        self.publish_progress(session);
        self.changed.notify_waiters();
        transition.directive
    }

    fn publish_progress(&self, session: &WorkflowSession) {
        let steps = self
            .definitions
            .get(&session.workflow_type)
            .map(|d| d.steps.as_slice())
            .unwrap_or_default();
        let step = if session.is_terminal() {
            None
        } else {
            steps.get(session.current_step_index).map(|s| s.name.clone())
        };
        let progress = ProgressPayload {
            session_id: session.session_id.clone(),
            workflow_type: session.workflow_type.to_string(),
            status: session.status.to_string(),
            step,
            steps_completed: session.steps_completed.len(),
            total_steps: steps.len(),
        };
        match serde_json::to_value(&progress) {
            Ok(payload) => self.bus.publish(Envelope::notify(
                &self.orchestrator_id,
                Recipient::All,
                MessageKind::StatusUpdate,
                payload,
            )),
            Err(e) => tracing::warn!("Session {} progress not published: {}", session.session_id, e),
        }
    }

    /// Feed an observed outcome through the state machine.
    async fn apply(&self, session_id: &str, event: SessionEvent) -> Result<Directive> {
        let Some(slot) = self.live(session_id) else {
            tracing::debug!("Session {} is no longer live, dropping event", session_id);
            return Ok(Directive::Ignore);
        };
        let mut state = slot.lock().await;
        let definition = self.definition(state.session.workflow_type)?;
        let transition = advance(&state.session, definition, event, Utc::now())?;
        if transition.directive == Directive::Ignore {
            tracing::debug!("Session {} ignored a stale event", session_id);
            return Ok(Directive::Ignore);
        }
        Ok(self.commit(&slot, &mut state, transition).await)
    }

    fn spawn_driver(self: &Arc<Self>, session_id: String, directive: Directive, token: CancellationToken) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drive(session_id, directive, token).await });
    }

    async fn drive(self: Arc<Self>, session_id: String, mut directive: Directive, token: CancellationToken) {
        loop {
            let event = match directive {
                Directive::Dispatch { step_index, attempt } => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        event = self.run_step(&session_id, step_index, attempt) => event,
                    }
                }
                Directive::Backoff { step_index, retry } => {
                    let delay = self.backoff.delay(retry);
                    tracing::warn!(
                        "Session {} retrying step {} in {}ms (retry {})",
                        session_id,
                        step_index,
                        delay.as_millis(),
                        retry
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => SessionEvent::RetryDue { step_index },
                    }
                }
                Directive::Finished(status) => {
                    tracing::debug!("Driver for {} done ({})", session_id, status);
                    break;
                }
                Directive::Ignore => break,
            };

            directive = match self.apply(&session_id, event).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!("Session {} driver stopped: {}", session_id, e);
                    break;
                }
            };
        }
    }

    async fn run_step(&self, session_id: &str, step_index: usize, attempt: u32) -> SessionEvent {
        match self.execute_step(session_id, step_index, attempt).await {
            Ok((output, conflicts)) => SessionEvent::StepSucceeded {
                step_index,
                output,
                conflicts,
            },
            Err(failure) => {
                tracing::warn!(
                    "Session {} step {} attempt {} failed: {}",
                    session_id,
                    step_index,
                    attempt,
                    failure.message
                );
                SessionEvent::StepFailed {
                    step_index,
                    code: failure.code,
                    message: failure.message,
                }
            }
        }
    }

    async fn execute_step(
        &self,
        session_id: &str,
        step_index: usize,
        attempt: u32,
    ) -> std::result::Result<(Value, Vec<ConflictRecord>), StepFailure> {
        let slot = self
            .live(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;
        let (workflow_type, context) = {
            let state = slot.lock().await;
            (state.session.workflow_type, state.session.context.clone())
        };
        let definition = self.definition(workflow_type)?;
        let step = definition.step(step_index).ok_or_else(|| {
            Error::InvalidTransition(format!("{} has no step {}", workflow_type, step_index))
        })?;

        let deadline = Instant::now() + step.step_timeout();
        let input = step_input(session_id, step, &context);
        tracing::debug!(
            "Session {} step {} ({}) attempt {}",
            session_id,
            step.name,
            step.capability,
            attempt
        );

        let Some(policy) = &step.conflict else {
            let agent = self
                .select_agents(&slot, step, deadline, false)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| Error::AgentUnavailable(step.capability.clone()))?;
            let (request, correlation_id) = self.prepare(&slot, session_id, step, &agent.agent_id, input).await?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self.bus.request(request, remaining).await;
            slot.lock().await.in_flight.remove(&correlation_id);
            let reply = interpret(&agent.agent_id, result)?;
            return Ok((reply.output, Vec::new()));
        };

        let agents = self.select_agents(&slot, step, deadline, true).await?;
        let mut requests = JoinSet::new();
        for agent in agents {
            let (request, correlation_id) = self
                .prepare(&slot, session_id, step, &agent.agent_id, input.clone())
                .await?;
            let bus = Arc::clone(&self.bus);
            let remaining = deadline.saturating_duration_since(Instant::now());
            requests.spawn(async move {
                let result = bus.request(request, remaining).await;
                (agent, correlation_id, result)
            });
        }

        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        let mut seq = 0;
        while let Some(joined) = requests.join_next().await {
            let (agent, correlation_id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!("Fan-out request task failed: {}", e);
                    continue;
                }
            };
            slot.lock().await.in_flight.remove(&correlation_id);
            match interpret(&agent.agent_id, result) {
                Ok(reply) => {
                    seq += 1;
                    let error_rate = agent.error_rate();
                    if reply.matches.is_empty() {
                        candidates.push(
                            Candidate::new(agent.agent_id.clone(), reply.output, seq)
                                .with_target(reply.target)
                                .with_reported_score(reply.score)
                                .with_error_rate(error_rate),
                        );
                        continue;
                    }
                    for m in reply.matches {
                        candidates.push(
                            Candidate::new(agent.agent_id.clone(), m.output, seq)
                                .with_target(Some(m.target))
                                .with_reported_score(m.score)
                                .with_error_rate(error_rate),
                        );
                    }
                }
                Err(failure) => {
                    tracing::warn!("Candidate from {} dropped: {}", agent.agent_id, failure.message);
                    failures.push(failure);
                }
            }
        }

        if candidates.is_empty() {
            return Err(failures.into_iter().next().unwrap_or(StepFailure {
                code: FailureCode::Internal,
                message: format!("no candidates for step {}", step.name),
            }));
        }

        score_candidates(&policy.scoring, &context, &mut candidates, self.search.as_ref()).await?;
        let (output, records) = resolve_step(session_id, &step.name, candidates, &definition.tie_break)?;
        for record in &records {
            let winner = record.winner().map(|c| c.agent_id.as_str()).unwrap_or("-");
            tracing::info!(
                "Session {} step {}: {} won {} of {} candidates ({})",
                session_id,
                step.name,
                winner,
                record.target.as_deref().unwrap_or(conflict::UNTARGETED),
                record.candidates.len(),
                record.reason
            );
        }
        Ok((output, records))
    }

    /// Pick agents for a step: the least-loaded idle one, or every idle one
    /// for a fan-out step. Waits for an agent to free up until `deadline`.
    async fn select_agents(
        &self,
        slot: &SharedSlot,
        step: &StepDefinition,
        deadline: Instant,
        fan_out: bool,
    ) -> Result<Vec<AgentHandle>> {
        let registry = self.bus.registry();
        let changed = registry.state_changed();

        loop {
            let notified = changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let capable = registry.find_by_capability(&step.capability).await;
            if capable.is_empty() {
                return Err(Error::UnknownRecipient(format!(
                    "no agent offers {}",
                    step.capability
                )));
            }
            if !capable.iter().any(|h| h.state.is_available()) {
                return Err(Error::AgentUnavailable(format!(
                    "every agent offering {} is in error or stopped",
                    step.capability
                )));
            }

            let idle: Vec<AgentHandle> = capable
                .into_iter()
                .filter(|h| h.state == AgentState::Idle)
                .collect();
            if !idle.is_empty() {
                if fan_out {
                    return Ok(idle);
                }
                let load = slot.lock().await.load.clone();
                let steps_run = |h: &AgentHandle| load.get(&h.agent_id).copied().unwrap_or(0);
                let pick = idle.into_iter().min_by(|a, b| {
                    steps_run(a)
                        .cmp(&steps_run(b))
                        .then_with(|| a.agent_id.cmp(&b.agent_id))
                });
                return Ok(pick.into_iter().collect());
            }

            tracing::debug!("No idle agent for {}, waiting", step.capability);
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::AgentUnavailable(format!(
                    "no agent offering {} became idle in time",
                    step.capability
                )));
            }
        }
    }

    /// Build the request and record it as in flight.
    async fn prepare(
        &self,
        slot: &SharedSlot,
        session_id: &str,
        step: &StepDefinition,
        agent_id: &str,
        input: Map<String, Value>,
    ) -> Result<(Envelope, String)> {
        let mut task = TaskPayload::new(step.capability.clone()).for_step(session_id, step.name.clone());
        task.input = input;
        let request = Envelope::request(&self.orchestrator_id, agent_id, &task)?;
        let correlation_id = request
            .correlation_id()
            .ok_or_else(|| Error::InvalidEnvelope("request without correlation id".to_string()))?
            .to_string();

        let mut state = slot.lock().await;
        state.in_flight.insert(correlation_id.clone(), agent_id.to_string());
        *state.load.entry(agent_id.to_string()).or_default() += 1;
        tracing::debug!("Step {} -> {} ({})", step.name, agent_id, correlation_id);
        Ok((request, correlation_id))
    }
}

/// Context values the step maps in; absent keys are left out.
fn step_input(session_id: &str, step: &StepDefinition, context: &Map<String, Value>) -> Map<String, Value> {
    let mut input = Map::new();
    for key in &step.inputs {
        match context.get(key) {
            Some(value) => {
                input.insert(key.clone(), value.clone());
            }
            None => tracing::debug!("Session {} step {}: no '{}' in context", session_id, step.name, key),
        }
    }
    input
}

fn interpret(agent_id: &str, result: Result<Envelope>) -> std::result::Result<ReplyPayload, StepFailure> {
    let reply = result?;
    if reply.kind() == MessageKind::Error {
        let error: ErrorPayload = reply.decode()?;
        return Err(StepFailure {
            code: error.code,
            message: format!("{}: {}", agent_id, error.message),
        });
    }
    Ok(reply.decode()?)
}
