//! External collaborators consumed by agents and the orchestrator.
//!
//! Each collaborator sits behind a narrow trait: inference, vector search and
//! session persistence.

use std::sync::Arc;

use thiserror::Error;

pub mod inference;
pub mod ollama;
pub mod search;
pub mod sqlite;
pub mod store;

pub use inference::{InferenceService, ScriptedInference};
pub use ollama::OllamaInference;
pub use search::{KeywordSearch, ScoredMatch, VectorSearch};
pub use sqlite::SqliteSessionStore;
pub use store::{MemorySessionStore, SessionStore};

use crate::config::InferenceSettings;
use crate::error::{Error, Result};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Service not available: {0}")]
    NotAvailable(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Timeout")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl ServiceError {
    pub fn other(s: impl Into<String>) -> Self {
        ServiceError::Other(s.into())
    }
}

/// Inference service factory.
pub fn create_inference(settings: &InferenceSettings) -> Result<Arc<dyn InferenceService>> {
    match settings.provider.as_str() {
        "scripted" => Ok(Arc::new(ScriptedInference::new())),
        "ollama" => {
            let mut service = match &settings.base_url {
                Some(url) => OllamaInference::with_base_url(url.clone()),
                None => OllamaInference::new(),
            };
            if let Some(model) = &settings.model {
                service = service.with_model(model.clone());
            }
            Ok(Arc::new(service))
        }
        other => Err(Error::Config(format!("unknown inference provider '{}'", other))),
    }
}
