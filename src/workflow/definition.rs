//! Static workflow templates and the built-in production catalog.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::roster::caps;
use crate::error::{Error, Result};
use crate::orchestrator::conflict::{ScoringRule, TieBreak};

/// Upper bound on `max_retries` for any step.
pub const MAX_STEP_RETRIES: u32 = 10;

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Closed set of workflows the orchestrator can run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    ProjectSetup,
    Storyboard,
    PreviewEdit,
    PackageReview,
}

impl WorkflowType {
    pub const ALL: [WorkflowType; 4] = [
        WorkflowType::ProjectSetup,
        WorkflowType::Storyboard,
        WorkflowType::PreviewEdit,
        WorkflowType::PackageReview,
    ];
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowType::ProjectSetup => write!(f, "project-setup"),
            WorkflowType::Storyboard => write!(f, "storyboard"),
            WorkflowType::PreviewEdit => write!(f, "preview-edit"),
            WorkflowType::PackageReview => write!(f, "package-review"),
        }
    }
}

impl FromStr for WorkflowType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WorkflowType::ALL
            .into_iter()
            .find(|t| t.to_string() == s.trim().to_lowercase())
            .ok_or_else(|| Error::NotFound(format!("workflow type '{}'", s)))
    }
}

/// How a fan-out step turns competing replies into one output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictPolicy {
    pub scoring: ScoringRule,
}

/// One step of a workflow, bound to a single capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    pub capability: String,
    /// Context keys copied into the step input
    pub inputs: Vec<String>,
    /// Context key receiving the step output
    pub output_key: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Present when every idle capable agent is asked and the replies are scored
    #[serde(default)]
    pub conflict: Option<ConflictPolicy>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            output_key: name.clone(),
            name,
            capability: capability.into(),
            inputs: Vec::new(),
            timeout_ms: DEFAULT_STEP_TIMEOUT.as_millis() as u64,
            max_retries: DEFAULT_MAX_RETRIES,
            conflict: None,
        }
    }

    pub fn inputs(mut self, keys: &[&str]) -> Self {
        self.inputs = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn output(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn fan_out(mut self, scoring: ScoringRule) -> Self {
        self.conflict = Some(ConflictPolicy { scoring });
        self
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Ordered list of steps plus the conflict tie-break order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub workflow_type: WorkflowType,
    pub steps: Vec<StepDefinition>,
    #[serde(default = "default_tie_break")]
    pub tie_break: Vec<TieBreak>,
}

fn default_tie_break() -> Vec<TieBreak> {
    vec![TieBreak::LowestErrorRate, TieBreak::SubmissionOrder]
}

impl WorkflowDefinition {
    pub fn new(workflow_type: WorkflowType, steps: Vec<StepDefinition>) -> Self {
        Self {
            workflow_type,
            steps,
            tie_break: default_tie_break(),
        }
    }

    pub fn with_tie_break(mut self, order: Vec<TieBreak>) -> Self {
        self.tie_break = order;
        self
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Check the template before it is used.
    ///
    /// Every step timeout must be shorter than `deadline` so retries still
    /// fit inside a caller-facing budget.
    pub fn validate(&self, deadline: Option<Duration>) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::Config(format!("workflow {} has no steps", self.workflow_type)));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(Error::Config(format!(
                    "workflow {} repeats step '{}'",
                    self.workflow_type, step.name
                )));
            }
            if step.timeout_ms == 0 {
                return Err(Error::Config(format!("step '{}' has a zero timeout", step.name)));
            }
            if step.max_retries > MAX_STEP_RETRIES {
                return Err(Error::Config(format!(
                    "step '{}' allows {} retries (max {})",
                    step.name, step.max_retries, MAX_STEP_RETRIES
                )));
            }
            if let Some(deadline) = deadline {
                if step.step_timeout() >= deadline {
                    return Err(Error::Config(format!(
                        "step '{}' timeout {}ms is not shorter than the workflow deadline {}ms",
                        step.name,
                        step.timeout_ms,
                        deadline.as_millis()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Built-in definition for a workflow type.
pub fn builtin(workflow_type: WorkflowType) -> WorkflowDefinition {
    let steps = match workflow_type {
        WorkflowType::ProjectSetup => vec![
            StepDefinition::new("outline_script", caps::SCRIPT_OUTLINE)
                .inputs(&["title", "brief"])
                .output("script"),
            StepDefinition::new("plan_schedule", caps::PM_SCHEDULE)
                .inputs(&["script", "deadline"])
                .output("schedule"),
            StepDefinition::new("assess_market", caps::MARKET_ANALYSIS)
                .inputs(&["brief", "script"])
                .output("market"),
        ],
        WorkflowType::Storyboard => vec![
            StepDefinition::new("breakdown_scenes", caps::SCRIPT_BREAKDOWN)
                .inputs(&["script"])
                .output("scenes"),
            StepDefinition::new("draft_frames", caps::STORYBOARD_FRAMES)
                .inputs(&["scenes", "style"])
                .output("frames"),
            StepDefinition::new("match_assets", caps::ART_ASSET_MATCH)
                .inputs(&["scenes", "style"])
                .output("assets")
                .fan_out(ScoringRule::PayloadScore {
                    field: "confidence".into(),
                }),
            StepDefinition::new("review_board", caps::DIRECTOR_REVIEW)
                .inputs(&["frames", "assets"])
                .output("review"),
        ],
        WorkflowType::PreviewEdit => vec![
            StepDefinition::new("assemble_cut", caps::STORYBOARD_SEQUENCE)
                .inputs(&["frames", "assets", "notes"])
                .output("cut"),
            StepDefinition::new("review_cut", caps::DIRECTOR_REVIEW)
                .inputs(&["cut", "notes"])
                .output("review"),
            StepDefinition::new("plan_render", caps::SYSTEM_RENDER_PLAN)
                .inputs(&["cut", "review"])
                .output("render_plan"),
        ],
        WorkflowType::PackageReview => vec![
            StepDefinition::new("collect_deliverables", caps::PM_INVENTORY)
                .inputs(&["deliverables", "schedule"])
                .output("inventory"),
            StepDefinition::new("assess_market", caps::MARKET_ANALYSIS)
                .inputs(&["brief", "inventory"])
                .output("market"),
            StepDefinition::new("final_approval", caps::DIRECTOR_APPROVE)
                .inputs(&["inventory", "market"])
                .output("approval"),
        ],
    };
    WorkflowDefinition::new(workflow_type, steps)
}

/// Shortest step timeout across `definitions`.
pub fn shortest_step_timeout<'a>(
    definitions: impl IntoIterator<Item = &'a WorkflowDefinition>,
) -> Option<Duration> {
    definitions
        .into_iter()
        .flat_map(|d| d.steps.iter())
        .map(StepDefinition::step_timeout)
        .min()
}

/// Every built-in definition keyed by type.
pub fn catalog() -> HashMap<WorkflowType, WorkflowDefinition> {
    WorkflowType::ALL
        .into_iter()
        .map(|t| (t, builtin(t)))
        .collect()
}
