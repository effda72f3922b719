//! Production roles and the default agent pack.
//!
//! Every role is served by the same [`RoleAgent`] type; roles differ only in
//! the capabilities they declare and how they turn a task into a reply.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::contract::{call_external, ExecutionContract};
use super::{Agent, AgentError};
use crate::protocol::{Envelope, MessageKind, ReplyPayload, TargetMatch, TaskPayload};
use crate::services::{InferenceService, VectorSearch};

/// Capability names.
pub mod caps {
    pub const SCRIPT_OUTLINE: &str = "script.outline";
    pub const SCRIPT_BREAKDOWN: &str = "script.breakdown";
    pub const ART_ASSET_MATCH: &str = "art.asset_match";
    pub const DIRECTOR_REVIEW: &str = "director.review";
    pub const DIRECTOR_APPROVE: &str = "director.approve";
    pub const MARKET_ANALYSIS: &str = "market.analysis";
    pub const PM_SCHEDULE: &str = "pm.schedule";
    pub const PM_INVENTORY: &str = "pm.inventory";
    pub const STORYBOARD_FRAMES: &str = "storyboard.frames";
    pub const STORYBOARD_SEQUENCE: &str = "storyboard.sequence";
    pub const SYSTEM_RENDER_PLAN: &str = "system.render_plan";
    pub const SYSTEM_PACKAGE: &str = "system.package";
}

const PROP_LIBRARY: &[&str] = &[
    "weathered lighthouse lamp",
    "fog machine haze over water",
    "wooden rowboat with oars",
    "brass ship compass",
    "neon city signage",
];

const SET_LIBRARY: &[&str] = &[
    "rocky coastline at night",
    "harbor pier in fog",
    "lighthouse interior spiral staircase",
    "rain soaked city alley",
    "sunlit meadow",
];

const PRODUCTION_PHASES: &[&str] = &["pre-production", "storyboard", "preview edit", "package review"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Script,
    Art,
    Director,
    Market,
    Pm,
    Storyboard,
    System,
}

impl AgentRole {
    pub const ALL: [AgentRole; 7] = [
        AgentRole::Script,
        AgentRole::Art,
        AgentRole::Director,
        AgentRole::Market,
        AgentRole::Pm,
        AgentRole::Storyboard,
        AgentRole::System,
    ];

    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            AgentRole::Script => &[caps::SCRIPT_OUTLINE, caps::SCRIPT_BREAKDOWN],
            AgentRole::Art => &[caps::ART_ASSET_MATCH],
            AgentRole::Director => &[caps::DIRECTOR_REVIEW, caps::DIRECTOR_APPROVE],
            AgentRole::Market => &[caps::MARKET_ANALYSIS],
            AgentRole::Pm => &[caps::PM_SCHEDULE, caps::PM_INVENTORY],
            AgentRole::Storyboard => &[caps::STORYBOARD_FRAMES, caps::STORYBOARD_SEQUENCE],
            AgentRole::System => &[caps::SYSTEM_RENDER_PLAN, caps::SYSTEM_PACKAGE],
        }
    }

    /// Agent id used by the default pack.
    pub fn default_id(&self) -> &'static str {
        match self {
            AgentRole::Script => "script",
            AgentRole::Art => "art",
            AgentRole::Director => "director",
            AgentRole::Market => "market",
            AgentRole::Pm => "pm",
            AgentRole::Storyboard => "storyboard",
            AgentRole::System => "system",
        }
    }

    fn instruction(capability: &str) -> &'static str {
        match capability {
            caps::SCRIPT_OUTLINE => "Outline the script in three acts.",
            caps::DIRECTOR_REVIEW => "Review the material and list required changes.",
            caps::MARKET_ANALYSIS => "Assess audience fit and comparable titles.",
            caps::PM_SCHEDULE => "Draft production notes for the schedule.",
            caps::PM_INVENTORY => "List the deliverables and flag anything missing.",
            caps::STORYBOARD_FRAMES => "Describe one key frame per scene.",
            caps::STORYBOARD_SEQUENCE => "Assemble the frames into a preview cut.",
            caps::SYSTEM_RENDER_PLAN => "Plan the render passes for the cut.",
            caps::SYSTEM_PACKAGE => "Describe the delivery package layout.",
            _ => "Complete the task.",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.default_id())
    }
}

/// One production role backed by an inference service and a vector search.
pub struct RoleAgent {
    id: String,
    role: AgentRole,
    inference: Arc<dyn InferenceService>,
    search: Arc<dyn VectorSearch>,
    contract: ExecutionContract,
    library: Vec<String>,
}

impl RoleAgent {
    pub fn new(
        id: impl Into<String>,
        role: AgentRole,
        inference: Arc<dyn InferenceService>,
        search: Arc<dyn VectorSearch>,
    ) -> Self {
        let contract = ExecutionContract::for_service(inference.name());
        Self {
            id: id.into(),
            role,
            inference,
            search,
            contract,
            library: Vec::new(),
        }
    }

    /// Asset descriptions the art role matches against.
    pub fn with_library(mut self, assets: &[&str]) -> Self {
        self.library = assets.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_contract(mut self, contract: ExecutionContract) -> Self {
        self.contract = contract;
        self
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    async fn perform(&self, task: &TaskPayload) -> Result<ReplyPayload, AgentError> {
        match task.capability.as_str() {
            caps::SCRIPT_BREAKDOWN => self.breakdown(task),
            caps::ART_ASSET_MATCH => self.match_asset(task).await,
            caps::PM_SCHEDULE => self.schedule(task).await,
            caps::DIRECTOR_APPROVE => self.approve(task).await,
            capability => {
                let text = self.complete(capability, task).await?;
                Ok(ReplyPayload::new(Value::String(text)))
            }
        }
    }

    async fn complete(&self, capability: &str, task: &TaskPayload) -> Result<String, AgentError> {
        let prompt = prompt(AgentRole::instruction(capability), task);
        let inference = Arc::clone(&self.inference);
        call_external(inference.name(), &self.contract, || {
            let inference = Arc::clone(&inference);
            let prompt = prompt.clone();
            async move { inference.complete(&prompt).await }
        })
        .await
    }

    fn breakdown(&self, task: &TaskPayload) -> Result<ReplyPayload, AgentError> {
        let script = task
            .input_text("script")
            .ok_or_else(|| AgentError::InvalidInput("breakdown needs a script".to_string()))?;
        let scenes = split_scenes(&script);
        let scenes: Vec<Value> = scenes
            .into_iter()
            .enumerate()
            .map(|(i, (heading, text))| {
                json!({"id": format!("scene-{}", i + 1), "heading": heading, "text": text})
            })
            .collect();
        Ok(ReplyPayload::new(Value::Array(scenes)))
    }

    /// Match every scene in `scenes` against the library, one target per
    /// scene id. Without a scene list the whole `frames`/`style` text is one
    /// query, targeted at `scene` when given.
    async fn match_asset(&self, task: &TaskPayload) -> Result<ReplyPayload, AgentError> {
        if self.library.is_empty() {
            return Err(AgentError::Unsupported(format!("{} has no asset library", self.id)));
        }
        let style = task.input_text("style").unwrap_or_default();

        if let Some(scenes) = task.input.get("scenes").and_then(Value::as_array) {
            let mut matches = Vec::with_capacity(scenes.len());
            for (i, scene) in scenes.iter().enumerate() {
                let target = scene
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("scene-{}", i + 1));
                let query = ["heading", "text"]
                    .iter()
                    .filter_map(|k| scene.get(*k).and_then(Value::as_str))
                    .chain(std::iter::once(style.as_str()))
                    .collect::<Vec<_>>()
                    .join(" ");
                let (output, score) = self.best_asset(&query).await?;
                matches.push(TargetMatch {
                    target,
                    output,
                    score: Some(score),
                });
            }
            if !matches.is_empty() {
                return Ok(ReplyPayload::from_matches(matches));
            }
        }

        let query = [task.input_text("frames"), Some(style)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if query.trim().is_empty() {
            return Err(AgentError::InvalidInput(
                "asset match needs scenes, frames or a style".to_string(),
            ));
        }
        let (output, score) = self.best_asset(&query).await?;
        let mut reply = ReplyPayload::new(output).with_score(score);
        if let Some(scene) = task.input_text("scene") {
            reply = reply.with_target(scene);
        }
        Ok(reply)
    }

    async fn best_asset(&self, query: &str) -> Result<(Value, f64), AgentError> {
        let search = Arc::clone(&self.search);
        let library = self.library.clone();
        let ranked = call_external(search.name(), &self.contract, || {
            let search = Arc::clone(&search);
            let library = library.clone();
            let query = query.to_string();
            async move { search.rank(&query, &library).await }
        })
        .await?;

        let best = ranked
            .first()
            .ok_or_else(|| AgentError::External("search returned nothing".to_string()))?;
        let alternatives: Vec<&str> = ranked
            .iter()
            .skip(1)
            .take(2)
            .map(|m| self.library[m.index].as_str())
            .collect();
        let output = json!({
            "asset": self.library[best.index],
            "confidence": best.score,
            "alternatives": alternatives,
        });
        Ok((output, best.score))
    }

    async fn schedule(&self, task: &TaskPayload) -> Result<ReplyPayload, AgentError> {
        let notes = self.complete(caps::PM_SCHEDULE, task).await?;
        let deadline = task.input_text("deadline").unwrap_or_else(|| "unscheduled".to_string());
        let milestones: Vec<Value> = PRODUCTION_PHASES
            .iter()
            .enumerate()
            .map(|(i, phase)| json!({"order": i + 1, "phase": phase}))
            .collect();
        Ok(ReplyPayload::new(json!({
            "deadline": deadline,
            "milestones": milestones,
            "notes": notes,
        })))
    }

    async fn approve(&self, task: &TaskPayload) -> Result<ReplyPayload, AgentError> {
        let missing: Vec<&str> = ["inventory", "market"]
            .into_iter()
            .filter(|k| task.input_text(k).map(|v| v.trim().is_empty()).unwrap_or(true))
            .collect();
        let notes = self.complete(caps::DIRECTOR_REVIEW, task).await?;
        Ok(ReplyPayload::new(json!({
            "approved": missing.is_empty(),
            "missing": missing,
            "notes": notes,
        })))
    }
}

#[async_trait]
impl Agent for RoleAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.role.capabilities().iter().map(|c| c.to_string()).collect()
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, AgentError> {
        if envelope.kind() != MessageKind::TaskRequest {
            tracing::debug!("{} noted {} from {}", self.id, envelope.kind(), envelope.sender());
            return Ok(None);
        }
        let task: TaskPayload = envelope.decode()?;
        let reply = self.perform(&task).await?;
        Ok(Some(envelope.reply(&self.id, &reply)?))
    }

    async fn on_start(&self) -> Result<(), AgentError> {
        tracing::debug!("{} ({}) ready on {}", self.id, self.role, self.inference.name());
        Ok(())
    }
}

/// One agent per role, plus a second art agent with its own library. Every
/// agent calls its collaborators under `contract`.
pub fn default_pack(
    inference: Arc<dyn InferenceService>,
    search: Arc<dyn VectorSearch>,
    contract: ExecutionContract,
) -> Vec<Arc<dyn Agent>> {
    let mut pack: Vec<Arc<dyn Agent>> = AgentRole::ALL
        .into_iter()
        .map(|role| {
            let mut agent = RoleAgent::new(
                role.default_id(),
                role,
                Arc::clone(&inference),
                Arc::clone(&search),
            )
            .with_contract(contract.clone());
            if role == AgentRole::Art {
                agent = agent.with_library(PROP_LIBRARY);
            }
            Arc::new(agent) as Arc<dyn Agent>
        })
        .collect();
    let sets = RoleAgent::new("art-sets", AgentRole::Art, Arc::clone(&inference), search)
        .with_library(SET_LIBRARY)
        .with_contract(contract);
    pack.push(Arc::new(sets));
    pack
}

fn prompt(instruction: &str, task: &TaskPayload) -> String {
    let mut prompt = format!("{}\n", instruction);
    for key in task.input.keys() {
        if let Some(text) = task.input_text(key) {
            prompt.push_str(&format!("{}: {}\n", key, text));
        }
    }
    prompt
}

/// Split on `INT.`/`EXT.` headings, falling back to blank-line paragraphs.
fn split_scenes(script: &str) -> Vec<(String, String)> {
    let mut scenes: Vec<(String, String)> = Vec::new();
    for line in script.lines() {
        let trimmed = line.trim();
        let upper = trimmed.to_uppercase();
        if upper.starts_with("INT.") || upper.starts_with("EXT.") {
            scenes.push((trimmed.to_string(), String::new()));
        } else if let Some((_, text)) = scenes.last_mut() {
            if !trimmed.is_empty() {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(trimmed);
            }
        }
    }
    if !scenes.is_empty() {
        return scenes;
    }
    script
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(i, p)| (format!("SCENE {}", i + 1), p.replace('\n', " ")))
        .collect()
}
