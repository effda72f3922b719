//! Configuration loading for StudioCrew.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::protocol::correlation::DEFAULT_DUPLICATE_WINDOW;
use crate::protocol::mailbox::DEFAULT_MAILBOX_CAPACITY;
use crate::workflow::{catalog, shortest_step_timeout, Backoff};

pub type Result<T> = std::result::Result<T, Error>;

/// Get the StudioCrew home directory (~/.studiocrew).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".studiocrew"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.studiocrew/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Write settings as pretty JSON, creating the parent directory.
pub fn save_settings(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.bus.mailbox_capacity == 0 {
        return Err(Error::Config("bus.mailbox_capacity must be at least 1".to_string()));
    }
    if settings.orchestrator.backoff_base_ms > settings.orchestrator.backoff_max_ms {
        return Err(Error::Config(format!(
            "orchestrator.backoff_base_ms ({}) exceeds backoff_max_ms ({})",
            settings.orchestrator.backoff_base_ms, settings.orchestrator.backoff_max_ms
        )));
    }
    if !matches!(settings.inference.provider.as_str(), "scripted" | "ollama") {
        return Err(Error::Config(format!(
            "inference.provider '{}' is not one of scripted, ollama",
            settings.inference.provider
        )));
    }
    if let Err(e) = tracing_subscriber::EnvFilter::try_new(&settings.logging.filter) {
        return Err(Error::Config(format!(
            "logging.filter '{}' is invalid: {}",
            settings.logging.filter, e
        )));
    }
    if let Some(secs) = settings.inference.timeout_secs {
        let step = shortest_step_timeout(catalog().values()).unwrap_or(Duration::MAX);
        if secs == 0 || Duration::from_secs(secs) >= step {
            return Err(Error::Config(format!(
                "inference.timeout_secs ({}) must be between 1 and the shortest step timeout ({}s)",
                secs,
                step.as_secs()
            )));
        }
    }
    Ok(())
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Message bus configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BusSettings {
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
    /// Resolved correlation ids remembered to flag duplicate replies
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window: usize,
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}

fn default_notification_capacity() -> usize {
    256
}

fn default_duplicate_window() -> usize {
    DEFAULT_DUPLICATE_WINDOW
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            notification_capacity: default_notification_capacity(),
            duplicate_window: default_duplicate_window(),
        }
    }
}

/// Orchestrator configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OrchestratorSettings {
    /// Sender id on task requests
    #[serde(default = "default_orchestrator_id")]
    pub orchestrator_id: String,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: bool,
    /// Caller-facing budget every step timeout must stay under
    #[serde(default = "default_workflow_deadline_secs")]
    pub workflow_deadline_secs: u64,
}

fn default_orchestrator_id() -> String {
    "orchestrator".to_string()
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_backoff_jitter() -> bool {
    true
}

fn default_workflow_deadline_secs() -> u64 {
    600
}

impl OrchestratorSettings {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
        .with_jitter(self.backoff_jitter)
    }

    pub fn workflow_deadline(&self) -> Duration {
        Duration::from_secs(self.workflow_deadline_secs)
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            orchestrator_id: default_orchestrator_id(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            workflow_deadline_secs: default_workflow_deadline_secs(),
        }
    }
}

/// Session storage configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StorageSettings {
    /// SQLite file; defaults to ~/.studiocrew/sessions.db
    pub sqlite_path: Option<PathBuf>,
}

impl StorageSettings {
    pub fn sqlite_path(&self) -> Result<PathBuf> {
        match &self.sqlite_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("sessions.db")),
        }
    }
}

/// Inference provider configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InferenceSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Per-call timeout; the provider's own contract applies when unset
    pub timeout_secs: Option<u64>,
}

fn default_provider() -> String {
    "scripted".to_string()
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            model: None,
            timeout_secs: None,
        }
    }
}

/// Agent supervisor configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SupervisorSettings {
    #[serde(default = "default_supervisor_enabled")]
    pub enabled: bool,
    /// How long an agent stays in `error` before it is reset
    #[serde(default = "default_reset_after_secs")]
    pub reset_after_secs: u64,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

fn default_supervisor_enabled() -> bool {
    true
}

fn default_reset_after_secs() -> u64 {
    30
}

fn default_scan_interval_ms() -> u64 {
    1000
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            enabled: default_supervisor_enabled(),
            reset_after_secs: default_reset_after_secs(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

/// Log output configuration. `RUST_LOG` still wins over `filter`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoggingSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Directory for the daily log file (defaults to the platform data dir)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Mirror logs to stderr
    #[serde(default = "default_log_console")]
    pub console: bool,
}

fn default_log_filter() -> String {
    "info,studiocrew=debug".to_string()
}

fn default_log_console() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            log_dir: None,
            console: default_log_console(),
        }
    }
}

/// StudioCrew settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub inference: InferenceSettings,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}
