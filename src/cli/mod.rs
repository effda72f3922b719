//! CLI commands for StudioCrew using clap.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use crate::config::{load_settings_from, load_settings_or_default, Settings};
use crate::studio::Studio;
use crate::workflow::{WorkflowSession, WorkflowType};

/// StudioCrew - multi-agent production studio.
#[derive(Parser)]
#[command(name = "studiocrew")]
#[command(version)]
#[command(about = "StudioCrew - agents that plan, storyboard and review productions", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.studiocrew/settings.json)
    #[arg(long, global = true, env = "STUDIOCREW_SETTINGS")]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a workflow to completion and print the session
    Run {
        /// project-setup, storyboard, preview-edit or package-review
        workflow: WorkflowType,

        /// Initial context as a JSON object
        #[arg(long, short)]
        context: Option<String>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },

    /// Show a stored session
    Status {
        session_id: String,
    },

    /// Resume a failed session from the step that failed
    Retry {
        session_id: String,
        step: String,

        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },

    /// Cancel an interrupted session
    Cancel {
        session_id: String,
    },

    /// List stored sessions
    Sessions,

    /// List workflow definitions
    Workflows,

    /// List the default agent pack
    Agents,

    /// Resume sessions interrupted by a crash
    Recover {
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
}

impl Commands {
    /// Run the command with already loaded settings.
    pub async fn run(&self, settings: &Settings) -> Result<()> {
        match &self.command {
            Command::Run {
                workflow,
                context,
                timeout_secs,
            } => cmd_run(settings, *workflow, context.as_deref(), *timeout_secs).await,
            Command::Status { session_id } => cmd_status(settings, session_id).await,
            Command::Retry {
                session_id,
                step,
                timeout_secs,
            } => cmd_retry(settings, session_id, step, *timeout_secs).await,
            Command::Cancel { session_id } => cmd_cancel(settings, session_id).await,
            Command::Sessions => cmd_sessions(settings).await,
            Command::Workflows => cmd_workflows(settings).await,
            Command::Agents => cmd_agents(settings).await,
            Command::Recover { timeout_secs } => cmd_recover(settings, *timeout_secs).await,
        }
    }

    /// Settings from `--settings`, else `~/.studiocrew/settings.json`, else defaults.
    pub fn load_settings(&self) -> Result<Settings> {
        match &self.settings {
            Some(path) => Ok(load_settings_from(path)?),
            None => Ok(load_settings_or_default()),
        }
    }
}

fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--context must be a JSON object"),
    }
}

fn print_session(session: &WorkflowSession) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(session)?);
    Ok(())
}

async fn cmd_run(
    settings: &Settings,
    workflow: WorkflowType,
    context: Option<&str>,
    timeout_secs: u64,
) -> Result<()> {
    let context = parse_context(context)?;
    let studio = Studio::open(settings).await?;
    let orchestrator = studio.orchestrator().clone();

    let session_id = orchestrator.start_workflow(workflow, context).await?;
    tracing::info!("Running {} as {}", workflow, session_id);

    let outcome = orchestrator
        .wait_for(&session_id, Duration::from_secs(timeout_secs))
        .await;
    studio.shutdown().await;

    print_session(&outcome?)
}

async fn cmd_status(settings: &Settings, session_id: &str) -> Result<()> {
    let studio = Studio::open(settings).await?;
    let session = studio.orchestrator().get_status(session_id).await;
    studio.shutdown().await;
    print_session(&session?)
}

async fn cmd_retry(settings: &Settings, session_id: &str, step: &str, timeout_secs: u64) -> Result<()> {
    let studio = Studio::open(settings).await?;
    let orchestrator = studio.orchestrator().clone();

    if !orchestrator.retry_step(session_id, step).await? {
        studio.shutdown().await;
        anyhow::bail!("session {} did not fail at step '{}'", session_id, step);
    }
    let outcome = orchestrator
        .wait_for(session_id, Duration::from_secs(timeout_secs))
        .await;
    studio.shutdown().await;
    print_session(&outcome?)
}

async fn cmd_cancel(settings: &Settings, session_id: &str) -> Result<()> {
    let studio = Studio::open(settings).await?;
    let accepted = studio.orchestrator().cancel_workflow(session_id).await;
    studio.shutdown().await;

    if accepted? {
        println!("Cancelled {}", session_id);
    } else {
        println!("Session {} already finished", session_id);
    }
    Ok(())
}

async fn cmd_sessions(settings: &Settings) -> Result<()> {
    let studio = Studio::open(settings).await?;
    let sessions = studio.orchestrator().list_sessions().await;
    studio.shutdown().await;

    let sessions = sessions?;
    if sessions.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }
    println!("{:<28} {:<16} {:<14} {:>5}  UPDATED", "SESSION", "WORKFLOW", "STATUS", "STEPS");
    for session in sessions {
        println!(
            "{:<28} {:<16} {:<14} {:>5}  {}",
            session.session_id,
            session.workflow_type.to_string(),
            session.status.to_string(),
            session.steps_completed.len(),
            session.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_workflows(settings: &Settings) -> Result<()> {
    let studio = Studio::open(settings).await?;
    for definition in studio.orchestrator().definitions() {
        println!("{}", definition.workflow_type);
        for (i, step) in definition.steps.iter().enumerate() {
            let fan_out = if step.conflict.is_some() { " (fan-out)" } else { "" };
            println!(
                "  {}. {:<22} {:<22} -> {:<12} timeout {}ms, retries {}{}",
                i + 1,
                step.name,
                step.capability,
                step.output_key,
                step.timeout_ms,
                step.max_retries,
                fan_out
            );
        }
    }
    studio.shutdown().await;
    Ok(())
}

async fn cmd_agents(settings: &Settings) -> Result<()> {
    let studio = Studio::open(settings).await?;
    let agents = studio.bus().registry().agents().await;
    studio.shutdown().await;

    for agent in agents {
        let capabilities: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
        println!("{:<12} {:<8} {}", agent.agent_id, agent.state.to_string(), capabilities.join(", "));
    }
    Ok(())
}

async fn cmd_recover(settings: &Settings, timeout_secs: u64) -> Result<()> {
    let studio = Studio::open(settings).await?;
    let orchestrator = studio.orchestrator().clone();

    let resumed = match orchestrator.recover().await {
        Ok(resumed) => resumed,
        Err(e) => {
            studio.shutdown().await;
            return Err(e.into());
        }
    };
    if resumed.is_empty() {
        println!("Nothing to recover.");
    }
    for session_id in &resumed {
        match orchestrator
            .wait_for(session_id, Duration::from_secs(timeout_secs))
            .await
        {
            Ok(session) => println!("{} {}", session.session_id, session.status),
            Err(e) => println!("{} still running: {}", session_id, e),
        }
    }
    studio.shutdown().await;
    Ok(())
}
