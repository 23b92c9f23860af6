//! Terminal reports for finished and failed runs.

use crate::gates::GateVerdict;
use crate::orchestrator::chain::ChainReport;
use crate::orchestrator::epic::{EpicOutcome, EpicReport};
use crate::orchestrator::state::CheckpointStore;
use crate::phase::PhaseType;
use crate::story::StoryStatus;
use console::style;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// What a user needs after a terminal failure: where it broke and how to
/// pick it up again.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub epic: u32,
    pub story: Option<String>,
    pub phase: Option<PhaseType>,
    pub verdict: Option<GateVerdict>,
    pub message: String,
    pub checkpoint_path: PathBuf,
    /// 1-based story number the resume command starts from.
    pub resume_from: Option<usize>,
    pub resume_command: String,
}

impl FailureReport {
    /// `None` when the epic succeeded.
    pub fn from_epic(report: &EpicReport) -> Option<Self> {
        let failure = report.last_failure.as_ref();
        let mut point = failure.map(|f| (f.story.clone(), f.phase, f.verdict));
        let (message, resume_from, resume_command) = match report.outcome {
            EpicOutcome::Success => return None,
            EpicOutcome::Interrupted => {
                let next = report.checkpoint.next_index() + 1;
                (
                    "run interrupted".to_string(),
                    Some(next),
                    format!("epicflow run {}", report.epic_id),
                )
            }
            EpicOutcome::GateFailed => {
                let gate = report.failed_gate();
                if let Some((phase, verdict)) = gate {
                    point = Some((None, phase, verdict));
                }
                (
                    match gate {
                        Some((phase, verdict)) => {
                            format!("{} verdict {}", phase.display_name(), verdict)
                        }
                        None => "epic gate failed".to_string(),
                    },
                    None,
                    format!("epicflow run {}", report.epic_id),
                )
            }
            EpicOutcome::StoriesBlocked => {
                let blocked: Vec<String> = report
                    .stories
                    .iter()
                    .filter(|s| s.status == StoryStatus::Blocked)
                    .map(|s| s.id.to_string())
                    .collect();
                let first = report.first_blocked();
                (
                    format!("stories blocked: {}", blocked.join(", ")),
                    first,
                    match first {
                        Some(n) => format!("epicflow run {} --start-from {}", report.epic_id, n),
                        None => format!("epicflow run {} --no-resume", report.epic_id),
                    },
                )
            }
        };

        Some(Self {
            epic: report.epic_id,
            story: point.as_ref().and_then(|(story, _, _)| story.clone()),
            phase: point.as_ref().map(|(_, phase, _)| *phase),
            verdict: point.as_ref().map(|(_, _, verdict)| *verdict),
            message,
            checkpoint_path: report.checkpoint_path.clone(),
            resume_from,
            resume_command,
        })
    }

    /// For runs that ended in an error: resume from whatever checkpoint made it to disk.
    pub fn from_error(epic: u32, error: &anyhow::Error, store: &CheckpointStore) -> Self {
        let checkpoint = store.load().ok().flatten().filter(|cp| cp.epic_id == epic);
        let resume_from = checkpoint.as_ref().map(|cp| cp.next_index() + 1);
        Self {
            epic,
            story: None,
            phase: None,
            verdict: None,
            message: format!("{:#}", error),
            checkpoint_path: store.path().to_path_buf(),
            resume_from,
            resume_command: format!("epicflow run {}", epic),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Epic {} failed: {}", self.epic, self.message);
        if let Some(story) = &self.story {
            let _ = writeln!(out, "  Story:      {}", story);
        }
        if let Some(phase) = self.phase {
            let _ = writeln!(out, "  Phase:      {}", phase.display_name());
        }
        if let Some(verdict) = self.verdict {
            let _ = writeln!(out, "  Verdict:    {}", verdict);
        }
        let _ = writeln!(out, "  Checkpoint: {}", self.checkpoint_path.display());
        if let Some(n) = self.resume_from {
            let _ = writeln!(out, "  Resume at:  story #{}", n);
        }
        let _ = write!(out, "  Resume:     {}", self.resume_command);
        out
    }

    pub fn print(&self) {
        eprintln!();
        eprintln!("{}", style("Run failed").red().bold());
        for line in self.render().lines() {
            eprintln!("{}", line);
        }
        eprintln!();
    }
}

fn verdict_cell(verdict: Option<GateVerdict>) -> String {
    match verdict {
        Some(GateVerdict::Pass) => style("PASS").green().to_string(),
        Some(GateVerdict::Concerns) => style("CONCERNS").yellow().to_string(),
        Some(v) => style(v.to_string()).red().to_string(),
        None => style("-").dim().to_string(),
    }
}

fn status_cell(status: StoryStatus) -> String {
    match status {
        StoryStatus::Done => style(status.to_string()).green().to_string(),
        StoryStatus::Blocked => style(status.to_string()).red().to_string(),
        StoryStatus::Skipped => style(status.to_string()).yellow().to_string(),
        _ => status.to_string(),
    }
}

pub fn print_epic_summary(report: &EpicReport) {
    println!();
    println!(
        "{} {}",
        style(format!("Epic {}", report.epic_id)).bold().cyan(),
        style(format!("({})", report.outcome.label())).dim()
    );
    for story in &report.stories {
        println!(
            "  {:<8} {}{}",
            story.id.to_string(),
            status_cell(story.status),
            story
                .reason
                .as_ref()
                .map(|r| format!("  {}", style(r).dim()))
                .unwrap_or_default()
        );
    }
    println!("  Traceability:   {}", verdict_cell(report.traceability));
    println!("  Acceptance doc: {}", verdict_cell(report.acceptance_doc));
    if report.acceptance_gate.is_some() {
        println!("  Acceptance:     {}", verdict_cell(report.acceptance_gate));
    }
    if let Some(secs) = report.metrics.duration_secs {
        println!("  Duration:       {:.0}s", secs);
    }
    println!();
}

pub fn print_chain_summary(report: &ChainReport, report_path: Option<&Path>) {
    for epic in &report.epics {
        print_epic_summary(epic);
    }
    let elapsed = report
        .ended_at
        .signed_duration_since(report.started_at)
        .num_seconds()
        .max(0);
    match report.halted {
        Some(halt) => println!(
            "{} at epic {} ({:?}); not run: {:?}",
            style("Chain halted").red().bold(),
            halt.epic,
            halt.reason,
            report.not_run
        ),
        None => println!(
            "{} {} epics in {}s",
            style("Chain complete:").green().bold(),
            report.epics.len(),
            elapsed
        ),
    }
    if !report.tolerated_failures.is_empty() {
        println!(
            "  {} gate failures tolerated in epics {:?}",
            style("!").yellow(),
            report.tolerated_failures
        );
    }
    if let Some(path) = report_path {
        println!("  Report: {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::epic::StorySummary;
    use crate::orchestrator::metrics::EpicMetrics;
    use crate::orchestrator::state::{CheckpointReason, FailurePoint, RunState};
    use crate::story::StoryId;
    use chrono::Utc;
    use tempfile::tempdir;

    fn report(outcome: EpicOutcome) -> EpicReport {
        let mut state = RunState::new(3, "run", 0);
        state.record_story(0, StoryStatus::Done, Some(GateVerdict::Pass));
        state.record_story(1, StoryStatus::Blocked, Some(GateVerdict::Fail));
        state.record_failure(Some("3.2"), PhaseType::CodeReview, GateVerdict::Fail);
        EpicReport {
            epic_id: 3,
            run_id: "run".into(),
            outcome,
            start_index: 0,
            stories: vec![
                StorySummary {
                    id: StoryId::new(3, 1),
                    status: StoryStatus::Done,
                    reason: None,
                },
                StorySummary {
                    id: StoryId::new(3, 2),
                    status: StoryStatus::Blocked,
                    reason: Some("code_review gate failed".into()),
                },
            ],
            traceability: Some(GateVerdict::Pass),
            acceptance_doc: Some(GateVerdict::Pass),
            acceptance_gate: None,
            last_failure: Some(FailurePoint {
                story: Some("3.2".into()),
                phase: PhaseType::CodeReview,
                verdict: GateVerdict::Fail,
            }),
            checkpoint: state.to_checkpoint(CheckpointReason::StoryFinished, Utc::now()),
            checkpoint_path: PathBuf::from(".epicflow/state/epic-3.checkpoint.json"),
            metrics: EpicMetrics::new(3, "run", 2, Utc::now()),
        }
    }

    #[test]
    fn test_success_has_no_failure_report() {
        assert!(FailureReport::from_epic(&report(EpicOutcome::Success)).is_none());
    }

    #[test]
    fn test_blocked_report_names_story_phase_and_resume() {
        let failure = FailureReport::from_epic(&report(EpicOutcome::StoriesBlocked)).unwrap();
        assert_eq!(failure.story.as_deref(), Some("3.2"));
        assert_eq!(failure.phase, Some(PhaseType::CodeReview));
        assert_eq!(failure.resume_from, Some(2));
        let text = failure.render();
        assert!(text.contains("Code review"));
        assert!(text.contains("FAIL"));
        assert!(text.contains("epicflow run 3 --start-from 2"));
        assert!(text.contains("epic-3.checkpoint.json"));
    }

    #[test]
    fn test_interrupted_resumes_after_checkpoint() {
        let failure = FailureReport::from_epic(&report(EpicOutcome::Interrupted)).unwrap();
        assert_eq!(failure.resume_from, Some(3));
        assert_eq!(failure.resume_command, "epicflow run 3");
    }

    #[test]
    fn test_failed_epic_gate_is_reported() {
        let mut epic = report(EpicOutcome::GateFailed);
        epic.traceability = Some(GateVerdict::Fail);
        let failure = FailureReport::from_epic(&epic).unwrap();
        assert_eq!(failure.story, None);
        assert_eq!(failure.phase, Some(PhaseType::Traceability));
        assert_eq!(failure.verdict, Some(GateVerdict::Fail));
        assert_eq!(failure.resume_from, None);
        let text = failure.render();
        assert!(text.contains("Traceability verdict FAIL"));
        assert!(text.contains("epicflow run 3"));
    }

    #[test]
    fn test_from_error_without_checkpoint() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp.json"), 24);
        let err = anyhow::anyhow!("disk full");
        let failure = FailureReport::from_error(4, &err, &store);
        assert_eq!(failure.resume_from, None);
        assert!(failure.render().contains("disk full"));
    }
}
