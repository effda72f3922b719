//! Inference service trait and the offline scripted implementation.

use async_trait::async_trait;

use super::ServiceError;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Text/label inference invoked by agent `handle()` bodies.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Service name.
    fn name(&self) -> &str;

    /// Complete a prompt.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Deterministic inference that summarizes the prompt instead of calling a model.
///
/// Used by the default runtime when no model is configured, and in tests.
#[derive(Debug, Default, Clone)]
pub struct ScriptedInference;

impl ScriptedInference {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut lines = prompt.lines().map(str::trim).filter(|l| !l.is_empty());
        let task = lines.next().unwrap_or("task");
        let body: Vec<&str> = lines.collect();
        let summary = body.join(" ");
        let summary: String = summary.chars().take(160).collect();
        Ok(format!("[{}] {}", task.trim_end_matches('.'), summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_completion_is_deterministic() {
        let service = ScriptedInference::new();
        let prompt = "Outline the script.\nbrief: a lighthouse keeper finds a map";
        let a = service.complete(prompt).await.unwrap();
        let b = service.complete(prompt).await.unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("[Outline the script]"));
        assert!(a.contains("lighthouse"));
    }
}
