//! Execution contracts for external collaborator calls: timeout, retries and failure classification.

use std::future::Future;
use std::time::Duration;

use super::AgentError;
use crate::services::ServiceError;

#[derive(Debug, Clone)]
pub struct ExecutionContract {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ExecutionContract {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retries: 1,
            retry_backoff: Duration::from_millis(600),
        }
    }
}

impl ExecutionContract {
    pub fn for_service(service: &str) -> Self {
        match service {
            "ollama" => Self {
                timeout: Duration::from_secs(240),
                retries: 1,
                retry_backoff: Duration::from_millis(800),
            },
            "scripted" => Self {
                timeout: Duration::from_secs(5),
                retries: 0,
                retry_backoff: Duration::from_millis(0),
            },
            _ => Self::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Longest a `call_external` under this contract can take.
    pub fn budget(&self) -> Duration {
        self.timeout * (self.retries + 1) + self.retry_backoff * self.retries
    }

    /// Shrink the per-call timeout so the whole budget stays under `limit`,
    /// leaving a tenth of it for queueing and the reply.
    pub fn fit_within(mut self, limit: Duration) -> Self {
        let usable = limit.mul_f64(0.9);
        if self.budget() <= usable {
            return self;
        }
        let backoff = self.retry_backoff * self.retries;
        if backoff >= usable {
            self.retries = 0;
            self.retry_backoff = Duration::ZERO;
        }
        let per_call = (usable - self.retry_backoff * self.retries) / (self.retries + 1);
        tracing::debug!(
            "External call timeout {}ms clamped to {}ms to fit a {}ms step",
            self.timeout.as_millis(),
            per_call.as_millis(),
            limit.as_millis()
        );
        self.timeout = per_call;
        self
    }
}

/// Run an external call under `contract`.
///
/// Whatever goes wrong (error, timeout) comes back as `AgentError::External`,
/// so the runtime answers with an error reply instead of faulting the agent.
pub async fn call_external<T, F, Fut>(
    label: &str,
    contract: &ExecutionContract,
    mut call: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let attempts = contract.retries + 1;
    let mut last_error: Option<ServiceError> = None;

    for attempt in 1..=attempts {
        match tokio::time::timeout(contract.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                let e = classify_error(e);
                tracing::warn!("{} attempt {}/{} failed: {}", label, attempt, attempts, e);
                last_error = Some(e);
            }
            Err(_) => {
                tracing::warn!(
                    "{} attempt {}/{} timed out after {}ms",
                    label,
                    attempt,
                    attempts,
                    contract.timeout.as_millis()
                );
                last_error = Some(ServiceError::Timeout);
            }
        }

        if attempt < attempts {
            tokio::time::sleep(contract.retry_backoff).await;
        }
    }

    let error = last_error.unwrap_or_else(|| ServiceError::other("call failed for unknown reason"));
    Err(AgentError::External(format!("{}: {}", label, error)))
}

fn classify_error(error: ServiceError) -> ServiceError {
    let ServiceError::Other(message) = &error else {
        return error;
    };
    let m = message.to_lowercase();
    if m.contains("not available")
        || m.contains("connection")
        || m.contains("failed to connect")
    {
        ServiceError::NotAvailable(message.clone())
    } else if m.contains("timeout") || m.contains("timed out") {
        ServiceError::Timeout
    } else {
        error
    }
}
