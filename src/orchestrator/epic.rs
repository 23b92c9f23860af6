use crate::config::Config;
use crate::epic::Epic;
use crate::fixloop::{FixLoop, FixLoopOutcome, LoopState};
use crate::gates::{self, GateVerdict};
use crate::orchestrator::chain::AcceptanceMode;
use crate::orchestrator::lock::EpicLock;
use crate::orchestrator::metrics::EpicMetrics;
use crate::orchestrator::prompts::PromptFactory;
use crate::orchestrator::runner::AgentRunner;
use crate::orchestrator::shutdown::ExactlyOnce;
use crate::orchestrator::state::{
    Checkpoint, CheckpointReason, CheckpointStore, FailurePoint, ResumePoint, RunState,
    resume_point,
};
use crate::orchestrator::story::StoryExecutor;
use crate::phase::{PhaseResult, PhaseType};
use crate::prompt::AssembledPrompt;
use crate::story::{StoryId, StoryStatus};
use crate::tracker::Workspace;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct EpicRunOptions {
    /// 1-based story number.
    pub start_from: Option<usize>,
    pub no_resume: bool,
    /// Run the acceptance gate after the epic phases.
    pub acceptance: Option<AcceptanceMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicOutcome {
    Success,
    StoriesBlocked,
    /// Every story finished but an epic-level gate failed.
    GateFailed,
    Interrupted,
}

impl EpicOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            EpicOutcome::Success => "success",
            EpicOutcome::StoriesBlocked => "stories_blocked",
            EpicOutcome::GateFailed => "gate_failed",
            EpicOutcome::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorySummary {
    pub id: StoryId,
    pub status: StoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Everything a caller needs after an epic run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicReport {
    pub epic_id: u32,
    pub run_id: String,
    pub outcome: EpicOutcome,
    pub start_index: usize,
    pub stories: Vec<StorySummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceability: Option<GateVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_doc: Option<GateVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_gate: Option<GateVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailurePoint>,
    pub checkpoint: Checkpoint,
    pub checkpoint_path: PathBuf,
    pub metrics: EpicMetrics,
}

impl EpicReport {
    /// First blocked story, 1-based, for a `--start-from` hint.
    pub fn first_blocked(&self) -> Option<usize> {
        self.stories
            .iter()
            .position(|s| s.status == StoryStatus::Blocked)
            .map(|i| self.start_index + i + 1)
    }

    /// The failing epic-level gate, latest phase first.
    pub fn failed_gate(&self) -> Option<(PhaseType, GateVerdict)> {
        failed_gate(self.traceability, self.acceptance_doc, self.acceptance_gate)
    }
}

fn failed_gate(
    traceability: Option<GateVerdict>,
    acceptance_doc: Option<GateVerdict>,
    acceptance_gate: Option<GateVerdict>,
) -> Option<(PhaseType, GateVerdict)> {
    [
        (PhaseType::AcceptanceGate, acceptance_gate),
        (PhaseType::AcceptanceDoc, acceptance_doc),
        (PhaseType::Traceability, traceability),
    ]
    .into_iter()
    .find_map(|(phase, verdict)| verdict.filter(GateVerdict::is_failing).map(|v| (phase, v)))
}

/// Verdicts of the per-epic phases.
#[derive(Debug, Default)]
struct EpicPhases {
    traceability: Option<GateVerdict>,
    acceptance_doc: Option<GateVerdict>,
    acceptance_gate: Option<GateVerdict>,
}

/// Mutable run data threaded through the epic.
struct Run {
    state: RunState,
    metrics: EpicMetrics,
    stories: Vec<StorySummary>,
    phases: EpicPhases,
}

/// Runs every story of an epic, then the per-epic phases.
pub struct EpicExecutor<'a> {
    config: &'a Config,
    runner: &'a AgentRunner,
    workspace: &'a dyn Workspace,
    prompts: &'a PromptFactory,
    finalizer: ExactlyOnce,
}

impl<'a> EpicExecutor<'a> {
    pub fn new(
        config: &'a Config,
        runner: &'a AgentRunner,
        workspace: &'a dyn Workspace,
        prompts: &'a PromptFactory,
    ) -> Self {
        Self {
            config,
            runner,
            workspace,
            prompts,
            finalizer: ExactlyOnce::new(),
        }
    }

    pub async fn run(&self, epic: &Epic, options: &EpicRunOptions) -> Result<EpicReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let _lock = EpicLock::acquire(&self.config.lock_path(epic.id), epic.id, &run_id)?;

        let store = CheckpointStore::new(
            self.config.checkpoint_path(epic.id),
            self.config.flow.checkpoint.max_age_hours,
        );
        let now = Utc::now();
        let checkpoint = if options.start_from.is_none() && !options.no_resume {
            store.load_fresh(epic.id, now)
        } else {
            None
        };
        let resume = resume_point(
            epic.id,
            epic.len(),
            options.start_from,
            options.no_resume,
            checkpoint.as_ref(),
        )?;

        let state = match (&resume, &checkpoint) {
            (ResumePoint::Checkpoint(_), Some(cp)) => RunState::resume(epic.id, &run_id, cp),
            _ => RunState::new(epic.id, &run_id, resume.index()),
        };
        let start_index = state.next_index;
        tracing::info!(
            epic = epic.id,
            run_id = %run_id,
            stories = epic.len(),
            start = start_index + 1,
            resume = ?resume,
            "starting epic"
        );

        let mut run = Run {
            state,
            metrics: EpicMetrics::new(epic.id, &run_id, epic.len(), now),
            stories: Vec::new(),
            phases: EpicPhases::default(),
        };

        let result = self.drive(epic, options, &store, &mut run).await;

        let (outcome, reason) = match &result {
            Ok(EpicOutcome::Interrupted) => (EpicOutcome::Interrupted, CheckpointReason::Interrupted),
            Ok(EpicOutcome::Success) => (EpicOutcome::Success, CheckpointReason::EpicComplete),
            Ok(EpicOutcome::StoriesBlocked) => {
                (EpicOutcome::StoriesBlocked, CheckpointReason::StoryFinished)
            }
            // Resuming skips the finished stories and re-runs the epic phases.
            Ok(EpicOutcome::GateFailed) => (EpicOutcome::GateFailed, CheckpointReason::StoryFinished),
            Err(_) => (EpicOutcome::Interrupted, CheckpointReason::Aborted),
        };
        let label = if result.is_err() { "aborted" } else { outcome.label() };
        let checkpoint = self.finalize_once(&store, &mut run, reason, label);

        if let Err(e) = result {
            tracing::error!(epic = epic.id, error = %e, "epic aborted");
            return Err(e);
        }
        let checkpoint = match checkpoint {
            Some(cp) => cp,
            None => run.state.to_checkpoint(reason, Utc::now()),
        };

        Ok(EpicReport {
            epic_id: epic.id,
            run_id,
            outcome,
            start_index,
            stories: run.stories,
            traceability: run.phases.traceability,
            acceptance_doc: run.phases.acceptance_doc,
            acceptance_gate: run.phases.acceptance_gate,
            last_failure: run.state.last_failure.clone(),
            checkpoint,
            checkpoint_path: store.path().to_path_buf(),
            metrics: run.metrics,
        })
    }

    async fn drive(
        &self,
        epic: &Epic,
        options: &EpicRunOptions,
        store: &CheckpointStore,
        run: &mut Run,
    ) -> Result<EpicOutcome> {
        let executor = StoryExecutor::new(self.config, self.runner, self.workspace, self.prompts);

        for index in run.state.next_index..epic.len() {
            if self.runner.shutdown().is_triggered() {
                return Ok(EpicOutcome::Interrupted);
            }
            let story = &epic.stories[index];
            let outcome = executor.execute(story).await?;
            let id = story.id.to_string();

            for (phase, warnings) in &outcome.warnings {
                run.metrics.record_truncations(&story.scope(), *phase, warnings);
            }
            for record in &outcome.record.history {
                run.metrics.record_gate(
                    Some(&id),
                    record.phase,
                    record.verdict,
                    record.attempts.len(),
                    record.escalated,
                );
            }
            if outcome.interrupted {
                run.metrics.save(&self.config.metrics_path(epic.id))?;
                return Ok(EpicOutcome::Interrupted);
            }

            if let Some((phase, verdict)) = outcome.blocked_at {
                run.state.record_failure(Some(&id), phase, verdict);
            }
            run.state
                .record_story(index, outcome.status(), outcome.record.last_verdict());
            run.stories.push(StorySummary {
                id: story.id,
                status: outcome.status(),
                reason: outcome.record.reason.clone(),
            });
            run.metrics.sync_counts(&run.state);

            store.save(&run.state.to_checkpoint(CheckpointReason::StoryFinished, Utc::now()))?;
            run.metrics.save(&self.config.metrics_path(epic.id))?;
            tracing::info!(
                epic = epic.id,
                story = %story.id,
                status = %outcome.status(),
                done = run.state.completed,
                blocked = run.state.failed,
                skipped = run.state.skipped,
                "story finished, checkpoint written"
            );
        }

        // Per-epic phases.
        let scope = epic.scope();

        let Some(trace) = self
            .epic_phase(epic, run, PhaseType::Traceability, self.prompts.traceability(epic), true)
            .await
        else {
            return Ok(EpicOutcome::Interrupted);
        };
        run.phases.traceability = Some(trace.1);

        let Some(doc) = self
            .epic_phase(
                epic,
                run,
                PhaseType::AcceptanceDoc,
                self.prompts.acceptance_doc(epic, Some(&trace.0)),
                false,
            )
            .await
        else {
            return Ok(EpicOutcome::Interrupted);
        };
        run.phases.acceptance_doc = Some(doc.1);

        match options.acceptance {
            Some(mode) if mode != AcceptanceMode::Skip => {
                let Some(gate) = self
                    .epic_phase(
                        epic,
                        run,
                        PhaseType::AcceptanceGate,
                        self.prompts.acceptance_gate(epic, mode),
                        false,
                    )
                    .await
                else {
                    return Ok(EpicOutcome::Interrupted);
                };
                run.phases.acceptance_gate = Some(gate.1);
                run.metrics.record_chain_gate(gate.1);
                if gate.1.is_failing() {
                    run.state.record_failure(None, PhaseType::AcceptanceGate, gate.1);
                }
            }
            _ => tracing::debug!(scope = %scope, "acceptance gate not requested"),
        }

        let phases = &run.phases;
        if run.state.failed > 0 {
            Ok(EpicOutcome::StoriesBlocked)
        } else if failed_gate(phases.traceability, phases.acceptance_doc, phases.acceptance_gate)
            .is_some()
        {
            Ok(EpicOutcome::GateFailed)
        } else {
            Ok(EpicOutcome::Success)
        }
    }

    /// Run one epic-level phase with its fix loop. `None` when interrupted.
    async fn epic_phase(
        &self,
        epic: &Epic,
        run: &mut Run,
        phase: PhaseType,
        prompt: AssembledPrompt,
        self_heal: bool,
    ) -> Option<(PhaseResult, GateVerdict)> {
        if self.runner.shutdown().is_triggered() {
            return None;
        }
        let scope = epic.scope();
        let policy = self.config.flow.fix_policy(phase);
        let mut fix_loop = FixLoop::new(self.runner, self.workspace, policy, &scope);
        if self_heal {
            fix_loop = fix_loop.with_gate(&self.config.flow.gates);
        }

        let outcome: FixLoopOutcome = fix_loop
            .run(phase, prompt, |req| {
                if phase == PhaseType::Traceability {
                    self.prompts.traceability_heal(epic, &req)
                } else {
                    self.prompts.epic_fix(epic, &req)
                }
            })
            .await;

        run.metrics.record_truncations(&scope, phase, &outcome.warnings);
        if outcome.state == LoopState::Interrupted {
            return None;
        }

        if let Err(e) = self.workspace.stage_all() {
            tracing::warn!(epic = epic.id, %phase, error = %e, "failed to stage phase changes");
        }

        let verdict = gates::evaluate(&outcome.final_result, &self.config.flow.gates);
        run.metrics
            .record_gate(None, phase, verdict, outcome.attempts.len(), outcome.escalated);
        if verdict.is_failing() {
            tracing::warn!(epic = epic.id, %phase, %verdict, "epic phase gate not passed");
            if phase != PhaseType::AcceptanceGate {
                run.state.record_failure(None, phase, verdict);
            }
        } else {
            tracing::info!(epic = epic.id, %phase, %verdict, "epic phase finished");
        }
        Some((outcome.final_result, verdict))
    }

    /// Finalize metrics and write the final checkpoint. Runs at most once
    /// per executor, whichever path gets here first.
    fn finalize_once(
        &self,
        store: &CheckpointStore,
        run: &mut Run,
        reason: CheckpointReason,
        label: &str,
    ) -> Option<Checkpoint> {
        self.finalizer.run(|| {
            let now = Utc::now();
            run.metrics.sync_counts(&run.state);
            run.metrics.finalize(label, now);
            if let Err(e) = run.metrics.save(&self.config.metrics_path(run.state.epic_id)) {
                tracing::error!(error = %e, "failed to persist final metrics");
            }
            let checkpoint = run.state.to_checkpoint(reason, now);
            if let Err(e) = store.save(&checkpoint) {
                tracing::error!(error = %e, "failed to persist final checkpoint");
            }
            tracing::info!(
                epic = run.state.epic_id,
                outcome = label,
                checkpoint = %store.path().display(),
                "epic finalized"
            );
            checkpoint
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_gate_prefers_latest_phase() {
        assert_eq!(failed_gate(Some(GateVerdict::Pass), Some(GateVerdict::Concerns), None), None);
        assert_eq!(
            failed_gate(Some(GateVerdict::Fail), Some(GateVerdict::Pass), None),
            Some((PhaseType::Traceability, GateVerdict::Fail))
        );
        assert_eq!(
            failed_gate(
                Some(GateVerdict::Fail),
                Some(GateVerdict::Pass),
                Some(GateVerdict::Blocked)
            ),
            Some((PhaseType::AcceptanceGate, GateVerdict::Blocked))
        );
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(EpicOutcome::GateFailed.label(), "gate_failed");
        let json = serde_json::to_string(&EpicOutcome::GateFailed).unwrap();
        assert_eq!(json, "\"gate_failed\"");
    }
}
