//! Logging setup for StudioCrew using tracing.
//!
//! One daily rolling file plus an optional stderr mirror. The filter comes
//! from `RUST_LOG` when set, else from `logging.filter` in the settings.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSettings;

const LOG_FILE: &str = "studiocrew.log";

/// Install the global subscriber. Keep the guard alive until exit so the
/// file writer flushes.
pub fn init(settings: &LoggingSettings) -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = match &settings.log_dir {
        Some(dir) => dir.clone(),
        None => default_log_dir()?,
    };
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(settings)?,
    };

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // stdout carries command output; logs go to stderr
    let console_layer = settings.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::debug!("Logging to {} (filter {})", log_dir.display(), settings.filter);
    Ok((guard, log_dir))
}

fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    EnvFilter::try_new(&settings.filter)
        .with_context(|| format!("invalid log filter '{}'", settings.filter))
}

fn default_log_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "studiocrew", "studiocrew")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

    Ok(dirs.data_dir().join("logs"))
}

/// Initialize logging for tests (console only, no file). Safe to call repeatedly.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
