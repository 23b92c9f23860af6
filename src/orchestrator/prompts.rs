//! Built-in phase prompts.
//!
//! Wording is not a contract. What matters is the fragment layout: the task
//! and the result format are required, everything that only adds context is
//! optional and can be cut when the prompt grows past the ceiling.
//!
//! Per-phase guidance can be added without touching code:
//!
//! ```text
//! .epicflow/guidance/
//! ├── common.md          # included in every prompt
//! ├── dev.md             # included in Dev prompts
//! └── code_review.md
//! ```

use crate::epic::Epic;
use crate::fixloop::{FixReason, FixRequest};
use crate::flow_config::AgentSection;
use crate::orchestrator::chain::AcceptanceMode;
use crate::phase::{PhaseResult, PhaseType};
use crate::prompt::{AssembledPrompt, PromptBuilder};
use crate::story::Story;
use std::path::{Path, PathBuf};

pub const GUIDANCE_DIR: &str = "guidance";
pub const COMMON_GUIDANCE: &str = "common";

// Drop priorities: lower is cut first.
const PRIO_HISTORY: u8 = 10;
const PRIO_CHANGED_FILES: u8 = 20;
const PRIO_GUIDANCE: u8 = 30;
const PRIO_STORY_INDEX: u8 = 40;
const PRIO_PREVIOUS: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    pub max_chars: usize,
    pub min_fragment_chars: usize,
}

impl From<&AgentSection> for PromptLimits {
    fn from(agent: &AgentSection) -> Self {
        Self {
            max_chars: agent.max_prompt_chars,
            min_fragment_chars: agent.min_fragment_chars,
        }
    }
}

/// Reads optional guidance files from `.epicflow/guidance/`.
#[derive(Debug, Clone)]
pub struct GuidanceLoader {
    dir: PathBuf,
}

impl GuidanceLoader {
    pub fn new(epicflow_dir: &Path) -> Self {
        Self {
            dir: epicflow_dir.join(GUIDANCE_DIR),
        }
    }

    fn read(&self, name: &str) -> Option<String> {
        let path = self.dir.join(format!("{}.md", name));
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => Some(content.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read guidance file");
                None
            }
        }
    }

    /// Common guidance followed by the phase's own, as one prompt section.
    pub fn section_for(&self, phase: PhaseType) -> String {
        let parts: Vec<String> = [COMMON_GUIDANCE, phase.key()]
            .iter()
            .filter_map(|name| self.read(name))
            .collect();
        if parts.is_empty() {
            String::new()
        } else {
            format!("## PROJECT GUIDANCE\n\n{}", parts.join("\n\n"))
        }
    }
}

/// Builds every prompt the orchestrator sends.
#[derive(Debug, Clone)]
pub struct PromptFactory {
    limits: PromptLimits,
    guidance: GuidanceLoader,
    project_name: String,
}

impl PromptFactory {
    pub fn new(limits: PromptLimits, guidance: GuidanceLoader, project_name: &str) -> Self {
        Self {
            limits,
            guidance,
            project_name: project_name.to_string(),
        }
    }

    fn builder(&self) -> PromptBuilder {
        PromptBuilder::new(self.limits.max_chars, self.limits.min_fragment_chars)
    }

    /// Initial prompt for a per-story phase.
    pub fn story_phase(
        &self,
        story: &Story,
        phase: PhaseType,
        previous: Option<&PhaseResult>,
        changed_files: &[PathBuf],
    ) -> AssembledPrompt {
        let header = format!(
            "You are working on project '{}', story {} ({}).\n\n## TASK: {}\n\n{}",
            self.project_name,
            story.id,
            story.title,
            phase.display_name(),
            phase_instructions(phase)
        );

        self.builder()
            .required("task", header)
            .required("story", format!("## STORY\n\n{}", story.content.trim()))
            .optional("previous", previous.map(handoff_section).unwrap_or_default(), PRIO_PREVIOUS)
            .optional("changed_files", changed_files_section(changed_files), PRIO_CHANGED_FILES)
            .optional("guidance", self.guidance.section_for(phase), PRIO_GUIDANCE)
            .required("format", result_format(phase))
            .build()
    }

    /// Remediation prompt listing only the targeted issues.
    pub fn story_fix(&self, story: &Story, req: &FixRequest<'_>) -> AssembledPrompt {
        let header = format!(
            "You are working on project '{}', story {} ({}).\n\n## TASK: fix attempt {} for {}\n\n{}",
            self.project_name,
            story.id,
            story.title,
            req.attempt,
            req.phase.display_name(),
            fix_instructions(req)
        );

        self.builder()
            .required("task", header)
            .required("targets", targets_section(req))
            .optional("story", format!("## STORY\n\n{}", story.content.trim()), PRIO_HISTORY)
            .optional("guidance", self.guidance.section_for(req.phase), PRIO_GUIDANCE)
            .required("format", result_format(req.phase))
            .build()
    }

    pub fn traceability(&self, epic: &Epic) -> AssembledPrompt {
        let header = format!(
            "You are working on project '{}', epic {}.\n\n## TASK: {}\n\n{}",
            self.project_name,
            epic.id,
            PhaseType::Traceability.display_name(),
            phase_instructions(PhaseType::Traceability)
        );
        self.builder()
            .required("task", header)
            .optional("stories", story_index(epic), PRIO_STORY_INDEX)
            .optional("guidance", self.guidance.section_for(PhaseType::Traceability), PRIO_GUIDANCE)
            .required("format", result_format(PhaseType::Traceability))
            .build()
    }

    /// Self-heal prompt for traceability: write the missing test specifications.
    pub fn traceability_heal(&self, epic: &Epic, req: &FixRequest<'_>) -> AssembledPrompt {
        let header = format!(
            "You are working on project '{}', epic {}.\n\n## TASK: close traceability gaps (attempt {})\n\n\
             Requirement coverage is below the gate. Generate the missing test \
             specifications and tests for every uncovered acceptance criterion, \
             starting with top-priority (P0) requirements, then re-run the \
             traceability analysis.",
            self.project_name, epic.id, req.attempt
        );
        let coverage = req
            .previous
            .coverage
            .map(|c| format!("Current coverage: P0 {:.0}%, P1 {:.0}%.", c.top_tier, c.next_tier))
            .unwrap_or_else(|| "Current coverage could not be measured.".to_string());

        self.builder()
            .required("task", header)
            .required("coverage", coverage)
            .optional("targets", targets_section(req), PRIO_PREVIOUS)
            .optional("stories", story_index(epic), PRIO_STORY_INDEX)
            .required("format", result_format(PhaseType::Traceability))
            .build()
    }

    /// Remediation for epic-level phases other than traceability.
    pub fn epic_fix(&self, epic: &Epic, req: &FixRequest<'_>) -> AssembledPrompt {
        let header = format!(
            "You are working on project '{}', epic {}.\n\n## TASK: fix attempt {} for {}\n\n{}",
            self.project_name,
            epic.id,
            req.attempt,
            req.phase.display_name(),
            fix_instructions(req)
        );
        self.builder()
            .required("task", header)
            .required("targets", targets_section(req))
            .optional("stories", story_index(epic), PRIO_STORY_INDEX)
            .required("format", result_format(req.phase))
            .build()
    }

    pub fn acceptance_doc(&self, epic: &Epic, traceability: Option<&PhaseResult>) -> AssembledPrompt {
        let header = format!(
            "You are working on project '{}', epic {}.\n\n## TASK: {}\n\n{}",
            self.project_name,
            epic.id,
            PhaseType::AcceptanceDoc.display_name(),
            phase_instructions(PhaseType::AcceptanceDoc)
        );
        self.builder()
            .required("task", header)
            .optional("traceability", traceability.map(handoff_section).unwrap_or_default(), PRIO_PREVIOUS)
            .optional("stories", story_index(epic), PRIO_STORY_INDEX)
            .optional("guidance", self.guidance.section_for(PhaseType::AcceptanceDoc), PRIO_GUIDANCE)
            .required("format", result_format(PhaseType::AcceptanceDoc))
            .build()
    }

    pub fn acceptance_gate(&self, epic: &Epic, mode: AcceptanceMode) -> AssembledPrompt {
        let scope = match mode {
            AcceptanceMode::Quick => {
                "Run only the top-priority (P0) acceptance scenarios of the acceptance document."
            }
            _ => "Run every automatable acceptance scenario of the acceptance document.",
        };
        let header = format!(
            "You are working on project '{}', epic {}.\n\n## TASK: {}\n\n{} {}",
            self.project_name,
            epic.id,
            PhaseType::AcceptanceGate.display_name(),
            scope,
            phase_instructions(PhaseType::AcceptanceGate)
        );
        self.builder()
            .required("task", header)
            .optional("stories", story_index(epic), PRIO_STORY_INDEX)
            .optional("guidance", self.guidance.section_for(PhaseType::AcceptanceGate), PRIO_GUIDANCE)
            .required("format", result_format(PhaseType::AcceptanceGate))
            .build()
    }
}

fn phase_instructions(phase: PhaseType) -> &'static str {
    match phase {
        PhaseType::Dev => {
            "Implement the story. Follow its acceptance criteria exactly, check existing code \
             before changing it, and run the tests before reporting completion."
        }
        PhaseType::ArchCompliance => {
            "Review the changes for this story against the project's architecture: layering, \
             module boundaries, dependency direction. Report every violation with a severity."
        }
        PhaseType::CodeReview => {
            "Review the changes for this story as a senior engineer: correctness, error \
             handling, security, readability. Report every finding with a severity."
        }
        PhaseType::TestQuality => {
            "Assess the tests written for this story: do they assert behavior, cover edge \
             cases, and avoid flakiness? Give a quality score from 0 to 100."
        }
        PhaseType::Traceability => {
            "Map every acceptance criterion of the epic's stories to the tests that cover it. \
             Report coverage of top-priority (P0) and next-tier (P1) requirements as percentages."
        }
        PhaseType::AcceptanceDoc => {
            "Write the user acceptance document for this epic: one scenario per acceptance \
             criterion, marked automatable or manual."
        }
        PhaseType::AcceptanceGate => {
            "Report how many scenarios passed and failed. Manual scenarios are counted separately \
             and do not fail the gate."
        }
    }
}

fn fix_instructions(req: &FixRequest<'_>) -> String {
    match req.reason {
        FixReason::Issues => format!(
            "Fix only the {} issue{} listed below. Do not refactor unrelated code. \
             Then re-check your work and report the result again.",
            req.targets.len(),
            if req.targets.len() == 1 { "" } else { "s" }
        ),
        FixReason::PhaseFailed => format!(
            "The previous attempt reported failure ({}). Find the cause, fix it, and report \
             the result again.",
            req.previous.summary.as_deref().unwrap_or("no detail given")
        ),
        FixReason::UnclearResult => {
            "The previous answer did not contain a recognizable result. Finish the task and \
             report the result in the exact format below."
                .to_string()
        }
        FixReason::BelowGate => format!(
            "The previous result ({}) is below the quality gate for this phase. Close the gap \
             and report the result again.",
            req.previous.brief()
        ),
    }
}

fn targets_section(req: &FixRequest<'_>) -> String {
    if req.targets.is_empty() {
        return String::new();
    }
    let mut out = String::from("## ISSUES TO FIX\n");
    for (i, issue) in req.targets.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, issue));
    }
    out
}

fn handoff_section(previous: &PhaseResult) -> String {
    let mut out = format!("## PREVIOUS PHASE\n\n{}", previous.brief());
    if let Some(summary) = &previous.summary {
        out.push_str(&format!("\n\n{}", summary));
    }
    out
}

fn changed_files_section(files: &[PathBuf]) -> String {
    if files.is_empty() {
        return String::new();
    }
    let list: Vec<String> = files.iter().map(|f| format!("- {}", f.display())).collect();
    format!("## CHANGED FILES\n\n{}", list.join("\n"))
}

fn story_index(epic: &Epic) -> String {
    let lines: Vec<String> = epic
        .stories
        .iter()
        .map(|s| format!("- {} {} ({})", s.id, s.title, s.path.display()))
        .collect();
    format!("## STORIES IN EPIC {}\n\n{}", epic.id, lines.join("\n"))
}

/// The expected answer format, ending in a signal line for the phase.
pub fn result_format(phase: PhaseType) -> String {
    let extra = match phase {
        PhaseType::TestQuality => ",\n  \"score\": 0-100",
        PhaseType::Traceability => ",\n  \"coverage\": {\"p0\": 0-100, \"p1\": 0-100}",
        PhaseType::AcceptanceGate => ",\n  \"scenarios\": {\"passed\": 0, \"failed\": 0, \"manual\": 0}",
        _ => "",
    };
    let token = phase.signal_tokens().first().copied().unwrap_or("STATUS");
    format!(
        "## RESULT FORMAT\n\n\
         End your answer with exactly one fenced block:\n\n\
         ```json\n{{\n  \"status\": \"complete | concerns | blocked | failed\"{},\n  \
         \"summary\": \"one line\",\n  \
         \"issues\": [{{\"severity\": \"critical | high | medium | low\", \"category\": \"...\", \
         \"description\": \"...\", \"location\": \"file:line\", \"fixable\": true}}]\n}}\n```\n\n\
         Then a final line: `{}: <STATUS> - <one line summary>`\n\
         Report `blocked` only when you cannot continue without outside help.",
        extra, token
    )
}
