//! Process-wide assembly: one bus, the default agent pack, the orchestrator
//! and an optional supervisor, with explicit startup and teardown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agent::{default_pack, ExecutionContract};
use crate::config::{validate_settings, Settings};
use crate::core::bus::MessageBus;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::services::{create_inference, KeywordSearch, SessionStore, SqliteSessionStore, VectorSearch};
use crate::supervisor::Supervisor;
use crate::workflow::shortest_step_timeout;

pub struct Studio {
    bus: Arc<MessageBus>,
    orchestrator: Orchestrator,
    supervisor: Option<(Arc<Supervisor>, JoinHandle<()>)>,
}

impl Studio {
    /// Assemble with the SQLite session store from `settings.storage`.
    pub async fn open(settings: &Settings) -> Result<Self> {
        let path = settings.storage.sqlite_path()?;
        tracing::debug!("Session store at {}", path.display());
        let store = Arc::new(SqliteSessionStore::open(&path)?);
        Self::with_store(settings, store).await
    }

    pub async fn with_store(settings: &Settings, store: Arc<dyn SessionStore>) -> Result<Self> {
        validate_settings(settings)?;

        let bus = MessageBus::new(&settings.bus);
        let inference = create_inference(&settings.inference)?;
        let search: Arc<dyn VectorSearch> = Arc::new(KeywordSearch::new());

        let orchestrator = Orchestrator::builder(Arc::clone(&bus), store)
            .settings(&settings.orchestrator)
            .search(Arc::clone(&search))
            .build()?;

        let step_limit = shortest_step_timeout(orchestrator.definitions());
        let contract = agent_contract(settings, inference.name(), step_limit);
        for agent in default_pack(inference, search, contract) {
            bus.register_agent(agent, Vec::new()).await?;
        }

        let supervisor = if settings.supervisor.enabled {
            let supervisor = Arc::new(Supervisor::new(Arc::clone(&bus), &settings.supervisor));
            let task = {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move { supervisor.run().await })
            };
            Some((supervisor, task))
        } else {
            None
        };

        tracing::info!(
            "Studio ready with {} agent(s)",
            bus.registry().agents().await.len()
        );
        Ok(Self {
            bus,
            orchestrator,
            supervisor,
        })
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Stop drivers, checkpoint in-flight sessions, then drain every mailbox.
    pub async fn shutdown(self) {
        if let Some((supervisor, task)) = self.supervisor {
            supervisor.stop();
            if let Err(e) = task.await {
                tracing::warn!("Supervisor ended abnormally: {}", e);
            }
        }
        self.orchestrator.shutdown().await;
        self.bus.shutdown().await;
    }
}

/// Contract for the default pack's collaborator calls. A whole call,
/// retries included, has to finish inside the shortest step timeout.
fn agent_contract(settings: &Settings, service: &str, step_limit: Option<Duration>) -> ExecutionContract {
    let mut contract = ExecutionContract::for_service(service);
    if let Some(secs) = settings.inference.timeout_secs {
        contract = contract.with_timeout(Duration::from_secs(secs));
    }
    match step_limit {
        Some(limit) => contract.fit_within(limit),
        None => contract,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ResolutionReason;
    use crate::services::MemorySessionStore;
    use crate::workflow::{catalog, SessionStatus, WorkflowType};
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_default_studio_runs_every_workflow() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.storage.sqlite_path = Some(temp_dir.path().join("sessions.db"));
        let studio = Studio::open(&settings).await.unwrap();

        let mut context = Map::new();
        context.insert("title".to_string(), json!("Harbor Lights"));
        context.insert(
            "brief".to_string(),
            json!("A keeper restores a dark lighthouse before the storm"),
        );
        context.insert(
            "script".to_string(),
            json!("INT. LIGHTHOUSE - NIGHT\nThe keeper climbs.\n\nEXT. PIER - DAWN\nBoats return."),
        );

        for workflow_type in WorkflowType::ALL {
            let id = studio
                .orchestrator()
                .start_workflow(workflow_type, context.clone())
                .await
                .unwrap();
            let session = studio
                .orchestrator()
                .wait_for(&id, Duration::from_secs(10))
                .await
                .unwrap();
            assert_eq!(session.status, SessionStatus::Completed, "{}", workflow_type);
        }

        let sessions = studio.orchestrator().list_sessions().await.unwrap();
        assert_eq!(sessions.len(), WorkflowType::ALL.len());
        studio.shutdown().await;
    }

    #[tokio::test]
    async fn test_storyboard_resolves_assets_per_scene() {
        let mut settings = Settings::default();
        settings.supervisor.enabled = false;
        let studio = Studio::with_store(&settings, Arc::new(MemorySessionStore::new()))
            .await
            .unwrap();

        let mut context = Map::new();
        context.insert(
            "script".to_string(),
            json!("INT. LIGHTHOUSE - NIGHT\nThe keeper climbs the spiral staircase.\n\nEXT. PIER - DAWN\nA wooden rowboat with oars drifts."),
        );
        let id = studio
            .orchestrator()
            .start_workflow(WorkflowType::Storyboard, context)
            .await
            .unwrap();
        let session = studio
            .orchestrator()
            .wait_for(&id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);

        let targets: Vec<Option<&str>> = session.conflicts.iter().map(|c| c.target.as_deref()).collect();
        assert_eq!(targets, vec![Some("scene-1"), Some("scene-2")]);
        for record in &session.conflicts {
            assert_eq!(record.step, "match_assets");
            assert_eq!(record.candidates.len(), 2);
            assert_eq!(record.reason, ResolutionReason::HigherScore);
        }
        let winners: Vec<&str> = session
            .conflicts
            .iter()
            .map(|c| c.winner().unwrap().agent_id.as_str())
            .collect();
        assert_eq!(winners, vec!["art-sets", "art"]);

        let assets = &session.context["assets"];
        assert_eq!(assets["scene-1"]["asset"], json!("lighthouse interior spiral staircase"));
        assert_eq!(assets["scene-2"]["asset"], json!("wooden rowboat with oars"));
        studio.shutdown().await;
    }

    #[test]
    fn test_agent_contract_fits_step_timeouts() {
        let step = shortest_step_timeout(catalog().values()).unwrap();
        let mut settings = Settings::default();
        settings.inference.provider = "ollama".to_string();

        let contract = agent_contract(&settings, "ollama", Some(step));
        assert!(contract.budget() < step, "{:?} vs {:?}", contract.budget(), step);

        settings.inference.timeout_secs = Some(20);
        let contract = agent_contract(&settings, "ollama", Some(step));
        assert!(contract.budget() < step);
        assert!(contract.timeout <= Duration::from_secs(20));

        let scripted = agent_contract(&Settings::default(), "scripted", Some(step));
        assert_eq!(scripted.timeout, ExecutionContract::for_service("scripted").timeout);
    }

    #[tokio::test]
    async fn test_shutdown_stops_agents() {
        let mut settings = Settings::default();
        settings.supervisor.enabled = false;
        let studio = Studio::with_store(&settings, Arc::new(MemorySessionStore::new()))
            .await
            .unwrap();
        let bus = Arc::clone(studio.bus());
        assert!(!bus.registry().agents().await.is_empty());

        studio.shutdown().await;
        assert!(bus.registry().agents().await.is_empty());
    }
}
