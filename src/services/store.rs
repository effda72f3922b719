//! Session persistence seam.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::workflow::WorkflowSession;

/// Checkpoint store for workflow sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the stored snapshot of a session.
    async fn save_session(&self, session: &WorkflowSession) -> Result<()>;

    async fn load_session(&self, session_id: &str) -> Result<Option<WorkflowSession>>;

    /// All stored sessions, oldest first.
    async fn list_sessions(&self) -> Result<Vec<WorkflowSession>>;
}

/// In-process store keeping the serialized JSON of each session.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<BTreeMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save_session(&self, session: &WorkflowSession) -> Result<()> {
        let json = serde_json::to_string(session)?;
        self.sessions.lock().insert(session.session_id.clone(), json);
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<WorkflowSession>> {
        let json = self.sessions.lock().get(session_id).cloned();
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<WorkflowSession>> {
        let rows: Vec<String> = self.sessions.lock().values().cloned().collect();
        let mut sessions = rows
            .iter()
            .map(|json| serde_json::from_str::<WorkflowSession>(json))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{resolve, Candidate, TieBreak};
    use crate::workflow::{SessionStatus, WorkflowType};
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let store = MemorySessionStore::new();
        let mut session = WorkflowSession::new(
            WorkflowType::ProjectSetup,
            serde_json::json!({"brief": "a heist in Lisbon"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        session.status = SessionStatus::Running;
        session.retries_used = 1;

        store.save_session(&session).await.unwrap();
        let loaded = store.load_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded, session);

        store.save_session(&loaded).await.unwrap();
        let again = store.load_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(again, session);
        assert_eq!(store.len(), 1);
    }

    fn scored_session(i: u32) -> WorkflowSession {
        let n = f64::from(i);
        let mut first = Candidate::new("art", json!({"asset": "pier", "confidence": n / 7.0}), 0)
            .with_target(Some(format!("scene-{}", i)))
            .with_reported_score(Some(n * 0.1 / 7.0))
            .with_error_rate(1.0 / (n + 2.0));
        first.score = n * 0.1 / 7.0 + 1e-3 * n.sqrt();
        let mut second = Candidate::new("art-sets", json!({"asset": "dock"}), 1)
            .with_target(Some(format!("scene-{}", i)))
            .with_error_rate(1.0 / (n + 3.0));
        second.score = first.score / 3.0;
        let record = resolve(
            "01SESSION",
            "match_assets",
            Some(format!("scene-{}", i)),
            vec![first, second],
            &[TieBreak::LowestErrorRate, TieBreak::SubmissionOrder],
        )
        .unwrap();

        let mut session = WorkflowSession::new(WorkflowType::Storyboard, Map::new());
        session.context.insert("confidence".to_string(), json!(n / 13.0));
        session.conflicts.push(record);
        session
    }

    #[tokio::test]
    async fn test_scores_survive_round_trip() {
        let store = MemorySessionStore::new();
        for i in 0..2000 {
            let session = scored_session(i);
            store.save_session(&session).await.unwrap();
            let loaded = store.load_session(&session.session_id).await.unwrap().unwrap();
            assert_eq!(loaded, session, "session {}", i);
        }
        let listed = store.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 2000);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let store = MemorySessionStore::new();
        assert!(store.load_session("nope").await.unwrap().is_none());
        assert!(store.list_sessions().await.unwrap().is_empty());
    }
}
