use crate::config::Config;
use crate::epic::Epic;
use crate::errors::GateFailure;
use crate::gates::GateVerdict;
use crate::orchestrator::epic::{EpicExecutor, EpicOutcome, EpicReport, EpicRunOptions};
use crate::orchestrator::prompts::PromptFactory;
use crate::orchestrator::runner::AgentRunner;
use crate::orchestrator::state::write_atomic;
use crate::phase::PhaseType;
use crate::tracker::Workspace;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How much of the acceptance gate runs between epics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceMode {
    Full,
    /// Top-priority scenarios only.
    Quick,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainOptions {
    pub acceptance: AcceptanceMode,
    /// Halt on a failed gate or blocked stories.
    pub blocking: bool,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            acceptance: AcceptanceMode::Full,
            blocking: true,
        }
    }
}

/// Why the chain stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    GateFailed,
    StoriesBlocked,
    Interrupted,
    /// An epic ended in an error before reporting.
    Aborted,
}

impl HaltReason {
    /// Process exit code for this halt.
    pub fn exit_code(&self) -> i32 {
        match self {
            HaltReason::GateFailed | HaltReason::Aborted => 1,
            HaltReason::StoriesBlocked => 2,
            HaltReason::Interrupted => 130,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHalt {
    pub epic: u32,
    pub reason: HaltReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<GateVerdict>,
}

impl ChainHalt {
    fn new(epic: u32, reason: HaltReason) -> Self {
        Self {
            epic,
            reason,
            phase: None,
            verdict: None,
        }
    }

    /// The failing epic gate, when that is what halted the chain.
    pub fn gate_failure(&self) -> Option<GateFailure> {
        match (self.reason, self.verdict) {
            (HaltReason::GateFailed, Some(verdict)) => Some(GateFailure {
                scope: format!("epic {}", self.epic),
                phase: self.phase.unwrap_or(PhaseType::AcceptanceGate),
                verdict,
            }),
            _ => None,
        }
    }
}

/// Aggregated result of a chain run, handed to the report sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub acceptance: AcceptanceMode,
    pub blocking: bool,
    pub epics: Vec<EpicReport>,
    /// Epics never started because the chain halted.
    #[serde(default)]
    pub not_run: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<ChainHalt>,
    /// Gate failures logged while blocking was disabled.
    #[serde(default)]
    pub tolerated_failures: Vec<u32>,
}

impl ChainReport {
    pub fn exit_code(&self) -> i32 {
        self.halted.map(|h| h.reason.exit_code()).unwrap_or(0)
    }
}

/// Receives the chain report once the chain ends.
pub trait ReportSink: Send + Sync {
    /// Deliver the report. Returns where it was written, if anywhere.
    fn deliver(&self, report: &ChainReport) -> Result<Option<PathBuf>>;
}

/// Writes `chain-<run_id>.json` into the reports directory.
pub struct JsonReportSink {
    dir: PathBuf,
}

impl JsonReportSink {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("chain-{}.json", run_id))
    }
}

impl ReportSink for JsonReportSink {
    fn deliver(&self, report: &ChainReport) -> Result<Option<PathBuf>> {
        let path = self.path_for(&report.run_id);
        write_atomic(&path, report).context("Failed to write chain report")?;
        Ok(Some(path))
    }
}

/// Runs epics in order with an optional acceptance gate between them.
pub struct ChainExecutor<'a> {
    config: &'a Config,
    runner: &'a AgentRunner,
    workspace: &'a dyn Workspace,
    prompts: &'a PromptFactory,
    sink: &'a dyn ReportSink,
}

impl<'a> ChainExecutor<'a> {
    pub fn new(
        config: &'a Config,
        runner: &'a AgentRunner,
        workspace: &'a dyn Workspace,
        prompts: &'a PromptFactory,
        sink: &'a dyn ReportSink,
    ) -> Self {
        Self {
            config,
            runner,
            workspace,
            prompts,
            sink,
        }
    }

    pub async fn run(&self, epics: &[Epic], options: ChainOptions) -> Result<ChainReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let mut reports = Vec::new();
        let mut halted = None;
        let mut tolerated = Vec::new();
        let mut aborted = None;

        tracing::info!(
            run_id = %run_id,
            epics = epics.len(),
            acceptance = ?options.acceptance,
            blocking = options.blocking,
            "starting chain"
        );

        for epic in epics {
            let epic_options = EpicRunOptions {
                acceptance: Some(options.acceptance),
                ..Default::default()
            };
            let executor = EpicExecutor::new(self.config, self.runner, self.workspace, self.prompts);
            let report = match executor.run(epic, &epic_options).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(epic = epic.id, error = %e, "chain aborted");
                    halted = Some(ChainHalt::new(epic.id, HaltReason::Aborted));
                    aborted = Some(e);
                    break;
                }
            };

            let halt = match report.outcome {
                EpicOutcome::Interrupted => Some(ChainHalt::new(epic.id, HaltReason::Interrupted)),
                _ => self.apply_blocking(&report, options, &mut tolerated),
            };
            reports.push(report);

            if let Some(halt) = halt {
                tracing::error!(epic = halt.epic, reason = ?halt.reason, "chain halted");
                halted = Some(halt);
                break;
            }
        }

        let not_run = epics
            .iter()
            .skip(reports.len())
            .map(|e| e.id)
            .collect();

        let report = ChainReport {
            run_id,
            started_at,
            ended_at: Utc::now(),
            acceptance: options.acceptance,
            blocking: options.blocking,
            epics: reports,
            not_run,
            halted,
            tolerated_failures: tolerated,
        };

        match self.sink.deliver(&report) {
            Ok(Some(path)) => tracing::info!(report = %path.display(), "chain report written"),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "report sink failed"),
        }
        match aborted {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn apply_blocking(
        &self,
        report: &EpicReport,
        options: ChainOptions,
        tolerated: &mut Vec<u32>,
    ) -> Option<ChainHalt> {
        let gate_failed = report.failed_gate();
        let blocked = report.outcome == EpicOutcome::StoriesBlocked;

        if gate_failed.is_none() && !blocked {
            return None;
        }
        if !options.blocking {
            tracing::warn!(
                epic = report.epic_id,
                gate = ?gate_failed,
                stories_blocked = blocked,
                "gate failure tolerated, chain continues"
            );
            tolerated.push(report.epic_id);
            return None;
        }
        Some(match gate_failed {
            Some((phase, verdict)) => ChainHalt {
                epic: report.epic_id,
                reason: HaltReason::GateFailed,
                phase: Some(phase),
                verdict: Some(verdict),
            },
            None => ChainHalt::new(report.epic_id, HaltReason::StoriesBlocked),
        })
    }
}
