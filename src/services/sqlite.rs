//! SQLite-backed session checkpoints.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::store::SessionStore;
use crate::error::{Error, Result};
use crate::workflow::WorkflowSession;

pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn =
            Connection::open(path).map_err(|e| Error::Storage(format!("sqlite open: {}", e)))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("sqlite open: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                workflow_type TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, updated_at);
            "#,
        )
        .map_err(|e| Error::Storage(format!("sqlite init: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save_session(&self, session: &WorkflowSession) -> Result<()> {
        let body = serde_json::to_string(session)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, workflow_type, status, created_at, updated_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at,
                body = excluded.body",
            params![
                session.session_id,
                session.workflow_type.to_string(),
                session.status.to_string(),
                session.created_at.timestamp_millis(),
                session.updated_at.timestamp_millis(),
                body
            ],
        )
        .map_err(|e| Error::Storage(format!("sqlite save session: {}", e)))?;
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<WorkflowSession>> {
        let body: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT body FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(format!("sqlite load session: {}", e)))?
        };
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<WorkflowSession>> {
        let bodies: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare("SELECT body FROM sessions ORDER BY created_at ASC, id ASC")
                .map_err(|e| Error::Storage(format!("sqlite prepare list: {}", e)))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| Error::Storage(format!("sqlite list sessions: {}", e)))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Storage(format!("sqlite read session: {}", e)))?
        };
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(Error::from))
            .collect()
    }
}
