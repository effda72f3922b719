//! Scoring and tie-breaking of competing step outputs.
//!
//! A fan-out step asks every idle capable agent. Replies naming the same
//! target entity compete; the best one wins and a [`ConflictRecord`] keeps
//! every candidate for audit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::protocol::envelope::generate_id;
use crate::services::VectorSearch;

/// Group key for replies that name no target.
pub const UNTARGETED: &str = "_";

/// Step-defined scoring function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ScoringRule {
    /// Confidence the agent reported: `output[field]`, else the reply score
    PayloadScore { field: String },
    /// Similarity between `context[query_key]` and each candidate output
    Semantic { query_key: String },
}

/// One tie-break criterion, applied in definition order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    LowestErrorRate,
    SubmissionOrder,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResolutionReason {
    #[serde(rename = "higher score")]
    HigherScore,
    #[serde(rename = "lower error rate")]
    LowerErrorRate,
    #[serde(rename = "earlier submission")]
    EarlierSubmission,
}

impl ResolutionReason {
    fn from_tie_break(rule: TieBreak) -> Self {
        match rule {
            TieBreak::LowestErrorRate => ResolutionReason::LowerErrorRate,
            TieBreak::SubmissionOrder => ResolutionReason::EarlierSubmission,
        }
    }
}

impl std::fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionReason::HigherScore => write!(f, "higher score"),
            ResolutionReason::LowerErrorRate => write!(f, "lower error rate"),
            ResolutionReason::EarlierSubmission => write!(f, "earlier submission"),
        }
    }
}

/// A competing output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub candidate_id: String,
    pub agent_id: String,
    pub target: Option<String>,
    pub output: Value,
    /// Reported confidence from the reply, if any
    #[serde(default)]
    pub reported_score: Option<f64>,
    pub score: f64,
    /// Agent's mean historical error rate when the reply arrived
    pub error_rate: f64,
    /// Arrival order within the step
    pub submitted_seq: u64,
}

impl Candidate {
    pub fn new(agent_id: impl Into<String>, output: Value, submitted_seq: u64) -> Self {
        Self {
            candidate_id: generate_id(),
            agent_id: agent_id.into(),
            target: None,
            output,
            reported_score: None,
            score: 0.0,
            error_rate: 0.0,
            submitted_seq,
        }
    }

    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn with_reported_score(mut self, score: Option<f64>) -> Self {
        self.reported_score = score;
        self
    }

    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = error_rate;
        self
    }
}

/// Audit record of one resolved conflict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub session_id: String,
    pub step: String,
    pub target: Option<String>,
    /// Every candidate, ordered by submission
    pub candidates: Vec<Candidate>,
    pub selected: String,
    pub reason: ResolutionReason,
    pub resolved_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn winner(&self) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.candidate_id == self.selected)
    }
}

/// Fill in `score` on every candidate according to `rule`.
pub async fn score_candidates(
    rule: &ScoringRule,
    context: &Map<String, Value>,
    candidates: &mut [Candidate],
    search: &dyn VectorSearch,
) -> Result<()> {
    match rule {
        ScoringRule::PayloadScore { field } => {
            for candidate in candidates.iter_mut() {
                candidate.score = candidate
                    .output
                    .get(field)
                    .and_then(Value::as_f64)
                    .or(candidate.reported_score)
                    .unwrap_or(0.0);
            }
        }
        ScoringRule::Semantic { query_key } => {
            let query = context.get(query_key).map(value_text).ok_or_else(|| {
                Error::ConflictUnresolved(format!("no '{}' in context to score against", query_key))
            })?;
            let documents: Vec<String> = candidates.iter().map(|c| value_text(&c.output)).collect();
            let ranked = search
                .rank(&query, &documents)
                .await
                .map_err(|e| Error::ExternalDependency(format!("{}: {}", search.name(), e)))?;
            for m in ranked {
                if let Some(candidate) = candidates.get_mut(m.index) {
                    candidate.score = m.score;
                }
            }
        }
    }
    Ok(())
}

/// Pick a winner among scored candidates competing for one target.
///
/// The highest score wins; ties go through `tie_break` in order. A tie that
/// survives every criterion is [`Error::ConflictUnresolved`].
pub fn resolve(
    session_id: &str,
    step: &str,
    target: Option<String>,
    mut candidates: Vec<Candidate>,
    tie_break: &[TieBreak],
) -> Result<ConflictRecord> {
    if candidates.is_empty() {
        return Err(Error::ConflictUnresolved(format!("step '{}' has no candidates", step)));
    }
    candidates.sort_by(|a, b| {
        a.submitted_seq
            .cmp(&b.submitted_seq)
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });

    let best = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let mut pool: Vec<&Candidate> = candidates.iter().filter(|c| c.score == best).collect();
    let mut reason = ResolutionReason::HigherScore;

    for rule in tie_break {
        if pool.len() == 1 {
            break;
        }
        pool = match rule {
            TieBreak::LowestErrorRate => {
                let lowest = pool.iter().map(|c| c.error_rate).fold(f64::INFINITY, f64::min);
                pool.into_iter().filter(|c| c.error_rate == lowest).collect()
            }
            TieBreak::SubmissionOrder => {
                let first = pool.iter().map(|c| c.submitted_seq).min().unwrap_or(0);
                pool.into_iter().filter(|c| c.submitted_seq == first).collect()
            }
        };
        reason = ResolutionReason::from_tie_break(*rule);
    }

    if pool.len() != 1 {
        let agents: Vec<&str> = pool.iter().map(|c| c.agent_id.as_str()).collect();
        return Err(Error::ConflictUnresolved(format!(
            "step '{}' target {} tied between {}",
            step,
            target.as_deref().unwrap_or(UNTARGETED),
            agents.join(", ")
        )));
    }
    let selected = pool[0].candidate_id.clone();

    Ok(ConflictRecord {
        conflict_id: generate_id(),
        session_id: session_id.to_string(),
        step: step.to_string(),
        target,
        candidates,
        selected,
        reason,
        resolved_at: Utc::now(),
    })
}

/// Resolve every target group of a fan-out step.
///
/// Returns the step output and one record per contested target. When no
/// reply names a target the output is the single winner's output; otherwise
/// it is an object keyed by target.
pub fn resolve_step(
    session_id: &str,
    step: &str,
    candidates: Vec<Candidate>,
    tie_break: &[TieBreak],
) -> Result<(Value, Vec<ConflictRecord>)> {
    let targeted = candidates.iter().any(|c| c.target.is_some());
    let mut groups: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        let key = candidate.target.clone().unwrap_or_else(|| UNTARGETED.to_string());
        groups.entry(key).or_default().push(candidate);
    }

    let mut output = Map::new();
    let mut records = Vec::new();
    for (key, group) in groups {
        let target = (key != UNTARGETED).then(|| key.clone());
        if group.len() == 1 {
            output.insert(key, group[0].output.clone());
            continue;
        }
        let record = resolve(session_id, step, target, group, tie_break)?;
        if let Some(winner) = record.winner() {
            output.insert(key, winner.output.clone());
        }
        records.push(record);
    }

    if !targeted {
        let single = output.remove(UNTARGETED).unwrap_or(Value::Null);
        return Ok((single, records));
    }
    Ok((Value::Object(output), records))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::KeywordSearch;
    use serde_json::json;

    const DEFAULT_ORDER: [TieBreak; 2] = [TieBreak::LowestErrorRate, TieBreak::SubmissionOrder];

    fn scored(agent: &str, score: f64, seq: u64) -> Candidate {
        let mut c = Candidate::new(agent, json!({"asset": agent}), seq)
            .with_target(Some("scene-1".to_string()));
        c.score = score;
        c
    }

    #[test]
    fn test_higher_score_wins() {
        let record = resolve(
            "s1",
            "match_assets",
            Some("scene-1".to_string()),
            vec![scored("art-a", 0.82, 0), scored("art-b", 0.91, 1)],
            &DEFAULT_ORDER,
        )
        .unwrap();
        assert_eq!(record.candidates.len(), 2);
        assert_eq!(record.winner().unwrap().agent_id, "art-b");
        assert_eq!(record.reason, ResolutionReason::HigherScore);
        assert_eq!(record.reason.to_string(), "higher score");
    }

    #[test]
    fn test_selection_ignores_arrival_order() {
        for (a, b) in [(0.3, 0.7), (0.7, 0.3), (0.5, 0.51), (0.99, 0.01)] {
            let forward = vec![scored("art-a", a, 0), scored("art-b", b, 1)];
            let backward = vec![scored("art-b", b, 0), scored("art-a", a, 1)];
            let expected = if a > b { "art-a" } else { "art-b" };
            for candidates in [forward, backward] {
                let record = resolve("s", "m", None, candidates, &DEFAULT_ORDER).unwrap();
                assert_eq!(record.winner().unwrap().agent_id, expected);
            }
        }
    }

    #[test]
    fn test_tie_breaks() {
        let reliable = scored("art-a", 0.5, 1).with_error_rate(0.1);
        let flaky = scored("art-b", 0.5, 0).with_error_rate(0.4);
        let record = resolve("s", "m", None, vec![flaky, reliable], &DEFAULT_ORDER).unwrap();
        assert_eq!(record.winner().unwrap().agent_id, "art-a");
        assert_eq!(record.reason, ResolutionReason::LowerErrorRate);

        let first = scored("art-a", 0.5, 0);
        let second = scored("art-b", 0.5, 1);
        let record = resolve("s", "m", None, vec![second, first], &DEFAULT_ORDER).unwrap();
        assert_eq!(record.winner().unwrap().agent_id, "art-a");
        assert_eq!(record.reason, ResolutionReason::EarlierSubmission);
    }

    #[test]
    fn test_unbreakable_tie() {
        let a = scored("art-a", 0.5, 3);
        let b = scored("art-b", 0.5, 3);
        let err = resolve("s", "m", None, vec![a.clone(), b.clone()], &DEFAULT_ORDER).unwrap_err();
        assert!(matches!(err, Error::ConflictUnresolved(_)));

        let err = resolve("s", "m", None, vec![a, b], &[]).unwrap_err();
        assert!(matches!(err, Error::ConflictUnresolved(_)));
    }

    #[test]
    fn test_resolve_step_groups_by_target() {
        let mut c1 = scored("art-a", 0.82, 0);
        let mut c2 = scored("art-b", 0.91, 1);
        let mut c3 = Candidate::new("art-a", json!({"asset": "harbor"}), 2)
            .with_target(Some("scene-2".to_string()));
        c3.score = 0.4;
        c1.output = json!({"asset": "fog"});
        c2.output = json!({"asset": "lamp"});

        let (output, records) = resolve_step("s", "match_assets", vec![c1, c2, c3], &DEFAULT_ORDER)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target.as_deref(), Some("scene-1"));
        assert_eq!(output["scene-1"], json!({"asset": "lamp"}));
        assert_eq!(output["scene-2"], json!({"asset": "harbor"}));
    }

    #[test]
    fn test_resolve_step_untargeted() {
        let mut a = Candidate::new("x", json!("draft a"), 0);
        a.score = 0.2;
        let mut b = Candidate::new("y", json!("draft b"), 1);
        b.score = 0.6;
        let (output, records) = resolve_step("s", "m", vec![a, b], &DEFAULT_ORDER).unwrap();
        assert_eq!(output, json!("draft b"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, None);
    }

    #[tokio::test]
    async fn test_scoring_rules() {
        let mut candidates = vec![
            Candidate::new("a", json!({"confidence": 0.82}), 0),
            Candidate::new("b", json!({"note": "none"}), 1).with_reported_score(Some(0.4)),
        ];
        let rule = ScoringRule::PayloadScore {
            field: "confidence".to_string(),
        };
        score_candidates(&rule, &Map::new(), &mut candidates, &KeywordSearch::new())
            .await
            .unwrap();
        assert_eq!(candidates[0].score, 0.82);
        assert_eq!(candidates[1].score, 0.4);

        let mut context = Map::new();
        context.insert("style".to_string(), json!("foggy harbor at night"));
        let mut candidates = vec![
            Candidate::new("a", json!("sunny meadow"), 0),
            Candidate::new("b", json!("harbor fog night lamps"), 1),
        ];
        let rule = ScoringRule::Semantic {
            query_key: "style".to_string(),
        };
        score_candidates(&rule, &context, &mut candidates, &KeywordSearch::new())
            .await
            .unwrap();
        assert!(candidates[1].score > candidates[0].score);

        let missing = ScoringRule::Semantic {
            query_key: "absent".to_string(),
        };
        assert!(score_candidates(&missing, &context, &mut candidates, &KeywordSearch::new())
            .await
            .is_err());
    }
}
