use crate::gates::GateVerdict;
use crate::orchestrator::state::{RunState, write_atomic};
use crate::phase::PhaseType;
use crate::prompt::PromptWarning;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A verdict as it was recorded during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    /// `None` for epic-level phases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<String>,
    pub phase: PhaseType,
    pub verdict: GateVerdict,
    #[serde(default)]
    pub fix_attempts: usize,
    #[serde(default)]
    pub escalated: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncationRecord {
    pub scope: String,
    pub phase: PhaseType,
    #[serde(flatten)]
    pub warning: PromptWarning,
}

/// Per-epic run metrics. Append-only while the run is live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicMetrics {
    pub epic_id: u32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub stories_total: usize,
    #[serde(default)]
    pub stories_completed: usize,
    #[serde(default)]
    pub stories_failed: usize,
    #[serde(default)]
    pub stories_skipped: usize,
    #[serde(default)]
    pub gate_outcomes: Vec<GateOutcome>,
    /// Fix attempts per phase key.
    #[serde(default)]
    pub fix_attempts: BTreeMap<String, usize>,
    #[serde(default)]
    pub prompt_truncations: Vec<TruncationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_gate: Option<GateVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl EpicMetrics {
    pub fn new(epic_id: u32, run_id: &str, stories_total: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            epic_id,
            run_id: run_id.to_string(),
            started_at,
            ended_at: None,
            duration_secs: None,
            stories_total,
            stories_completed: 0,
            stories_failed: 0,
            stories_skipped: 0,
            gate_outcomes: Vec::new(),
            fix_attempts: BTreeMap::new(),
            prompt_truncations: Vec::new(),
            chain_gate: None,
            outcome: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn record_gate(
        &mut self,
        story: Option<&str>,
        phase: PhaseType,
        verdict: GateVerdict,
        fix_attempts: usize,
        escalated: bool,
    ) {
        if self.is_finalized() {
            tracing::warn!(epic = self.epic_id, %phase, "gate outcome after finalize ignored");
            return;
        }
        *self.fix_attempts.entry(phase.key().to_string()).or_default() += fix_attempts;
        self.gate_outcomes.push(GateOutcome {
            story: story.map(str::to_string),
            phase,
            verdict,
            fix_attempts,
            escalated,
            recorded_at: Utc::now(),
        });
    }

    pub fn record_truncations(&mut self, scope: &str, phase: PhaseType, warnings: &[PromptWarning]) {
        if warnings.is_empty() {
            return;
        }
        if self.is_finalized() {
            tracing::warn!(epic = self.epic_id, %phase, "truncations after finalize ignored");
            return;
        }
        for warning in warnings {
            self.prompt_truncations.push(TruncationRecord {
                scope: scope.to_string(),
                phase,
                warning: warning.clone(),
            });
        }
    }

    pub fn record_chain_gate(&mut self, verdict: GateVerdict) {
        if self.is_finalized() {
            tracing::warn!(epic = self.epic_id, %verdict, "chain gate after finalize ignored");
            return;
        }
        self.chain_gate = Some(verdict);
    }

    /// Copy story counts from the run state.
    pub fn sync_counts(&mut self, state: &RunState) {
        self.stories_completed = state.completed;
        self.stories_failed = state.failed;
        self.stories_skipped = state.skipped;
    }

    /// Close the run. Returns `false` if it was already closed.
    pub fn finalize(&mut self, outcome: &str, now: DateTime<Utc>) -> bool {
        if self.is_finalized() {
            return false;
        }
        let elapsed = now.signed_duration_since(self.started_at);
        self.ended_at = Some(now);
        self.duration_secs = Some(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
        self.outcome = Some(outcome.to_string());
        true
    }

    /// Verdict counts, e.g. for the status command.
    pub fn verdict_counts(&self) -> BTreeMap<GateVerdict, usize> {
        let mut counts = BTreeMap::new();
        for outcome in &self.gate_outcomes {
            *counts.entry(outcome.verdict).or_default() += 1;
        }
        counts
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self).context("Failed to write epic metrics")
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read metrics {}", path.display()))?;
        let metrics = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse metrics {}", path.display()))?;
        Ok(Some(metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::StoryStatus;
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_finalize_succeeds_once() {
        let start = Utc::now();
        let mut metrics = EpicMetrics::new(3, "run-1", 4, start);
        assert!(metrics.finalize("success", start + Duration::seconds(90)));
        assert!(!metrics.finalize("interrupted", start + Duration::seconds(120)));
        assert_eq!(metrics.outcome.as_deref(), Some("success"));
        assert_eq!(metrics.duration_secs, Some(90.0));
    }

    #[test]
    fn test_gate_outcomes_accumulate_fix_attempts() {
        let mut metrics = EpicMetrics::new(3, "run-1", 2, Utc::now());
        metrics.record_gate(Some("3.1"), PhaseType::CodeReview, GateVerdict::Pass, 2, false);
        metrics.record_gate(Some("3.2"), PhaseType::CodeReview, GateVerdict::Concerns, 1, false);
        metrics.record_gate(None, PhaseType::Traceability, GateVerdict::Fail, 3, false);

        assert_eq!(metrics.fix_attempts["code_review"], 3);
        assert_eq!(metrics.fix_attempts["traceability"], 3);
        let counts = metrics.verdict_counts();
        assert_eq!(counts[&GateVerdict::Pass], 1);
        assert_eq!(counts[&GateVerdict::Fail], 1);
    }

    #[test]
    fn test_no_appends_after_finalize() {
        let mut metrics = EpicMetrics::new(3, "run-1", 1, Utc::now());
        metrics.finalize("success", Utc::now());
        metrics.record_gate(Some("3.1"), PhaseType::Dev, GateVerdict::Pass, 0, false);
        metrics.record_chain_gate(GateVerdict::Fail);
        metrics.record_truncations(
            "story-3.1",
            PhaseType::Dev,
            &[PromptWarning::Dropped {
                fragment: "guidance".into(),
                original_chars: 120,
            }],
        );
        assert!(metrics.gate_outcomes.is_empty());
        assert_eq!(metrics.chain_gate, None);
        assert!(metrics.prompt_truncations.is_empty());
    }

    #[test]
    fn test_sync_counts_and_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/epic-3.metrics.json");
        let mut state = RunState::new(3, "run-1", 0);
        state.record_story(0, StoryStatus::Done, Some(GateVerdict::Pass));
        state.record_story(1, StoryStatus::Blocked, Some(GateVerdict::Fail));

        let mut metrics = EpicMetrics::new(3, "run-1", 2, Utc::now());
        metrics.sync_counts(&state);
        metrics.record_truncations(
            "story-3.1",
            PhaseType::Dev,
            &[PromptWarning::Dropped {
                fragment: "previous".into(),
                original_chars: 900,
            }],
        );
        metrics.save(&path).unwrap();

        let loaded = EpicMetrics::load(&path).unwrap().unwrap();
        assert_eq!(loaded, metrics);
        assert_eq!(loaded.stories_completed, 1);
        assert_eq!(loaded.stories_failed, 1);
        assert_eq!(loaded.prompt_truncations.len(), 1);
    }
}
