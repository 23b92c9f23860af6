//! Phase types and the typed result every phase produces.
//!
//! This module provides:
//! - `PhaseType` for the fixed story, epic and chain phase sequences
//! - `PhaseResult`, the immutable outcome of one agent invocation
//! - `Issue` and `Severity` for findings carried by a result
//! - Numeric side channels (`TestCounts`, `Coverage`, `ScenarioCounts`)

use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed set of phases the orchestrator knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Dev,
    ArchCompliance,
    CodeReview,
    TestQuality,
    Traceability,
    AcceptanceDoc,
    AcceptanceGate,
}

/// Per-story phase sequence.
pub const STORY_PHASES: [PhaseType; 4] = [
    PhaseType::Dev,
    PhaseType::ArchCompliance,
    PhaseType::CodeReview,
    PhaseType::TestQuality,
];

/// Per-epic phase sequence, run after every story.
pub const EPIC_PHASES: [PhaseType; 2] = [PhaseType::Traceability, PhaseType::AcceptanceDoc];

impl PhaseType {
    pub const ALL: [PhaseType; 7] = [
        PhaseType::Dev,
        PhaseType::ArchCompliance,
        PhaseType::CodeReview,
        PhaseType::TestQuality,
        PhaseType::Traceability,
        PhaseType::AcceptanceDoc,
        PhaseType::AcceptanceGate,
    ];

    /// Stable snake_case key used in config tables and file names.
    pub fn key(&self) -> &'static str {
        match self {
            PhaseType::Dev => "dev",
            PhaseType::ArchCompliance => "arch_compliance",
            PhaseType::CodeReview => "code_review",
            PhaseType::TestQuality => "test_quality",
            PhaseType::Traceability => "traceability",
            PhaseType::AcceptanceDoc => "acceptance_doc",
            PhaseType::AcceptanceGate => "acceptance_gate",
        }
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            PhaseType::Dev => "Development",
            PhaseType::ArchCompliance => "Architecture compliance",
            PhaseType::CodeReview => "Code review",
            PhaseType::TestQuality => "Test quality",
            PhaseType::Traceability => "Traceability",
            PhaseType::AcceptanceDoc => "Acceptance document",
            PhaseType::AcceptanceGate => "Acceptance gate",
        }
    }

    /// Signal-line tokens the agent may use to report this phase's status.
    pub fn signal_tokens(&self) -> &'static [&'static str] {
        match self {
            PhaseType::Dev => &["DEV_STATUS", "STORY_STATUS", "IMPLEMENTATION_STATUS"],
            PhaseType::ArchCompliance => &["ARCH_STATUS", "ARCHITECTURE_STATUS", "COMPLIANCE_STATUS"],
            PhaseType::CodeReview => &["REVIEW_STATUS", "CODE_REVIEW"],
            PhaseType::TestQuality => &["TEST_QUALITY", "TEST_QUALITY_STATUS"],
            PhaseType::Traceability => &["TRACEABILITY", "TRACEABILITY_STATUS"],
            PhaseType::AcceptanceDoc => &["ACCEPTANCE_DOC", "UAT_DOC_STATUS"],
            PhaseType::AcceptanceGate => &["ACCEPTANCE_GATE", "UAT_STATUS"],
        }
    }

    pub fn from_key(key: &str) -> Option<PhaseType> {
        let normalized = key.trim().to_lowercase().replace('-', "_");
        PhaseType::ALL.into_iter().find(|p| p.key() == normalized)
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Status reported for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Complete,
    Concerns,
    Blocked,
    Failed,
    /// No confident classification; retryable, never success.
    Unclear,
}

impl PhaseStatus {
    /// Map a status word from agent output onto the closed status set.
    pub fn parse_word(word: &str) -> Option<PhaseStatus> {
        let normalized = word
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '`')
            .to_lowercase()
            .replace([' ', '-'], "_");
        let status = match normalized.as_str() {
            "complete" | "completed" | "done" | "pass" | "passed" | "success" | "successful"
            | "approved" => PhaseStatus::Complete,
            "concerns" | "concern" | "warn" | "warning" | "pass_with_concerns" => {
                PhaseStatus::Concerns
            }
            "blocked" => PhaseStatus::Blocked,
            "fail" | "failed" | "failure" | "error" | "rejected" | "changes_requested" => {
                PhaseStatus::Failed
            }
            "unclear" | "unknown" => PhaseStatus::Unclear,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, PhaseStatus::Blocked)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Complete => "complete",
            PhaseStatus::Concerns => "concerns",
            PhaseStatus::Blocked => "blocked",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Unclear => "unclear",
        };
        write!(f, "{}", s)
    }
}

/// Issue severity. Ordered from most to least severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Severity {
    pub fn parse_word(word: &str) -> Option<Severity> {
        match word.trim().to_lowercase().as_str() {
            "critical" | "blocker" | "p0" => Some(Severity::Critical),
            "high" | "major" | "error" | "p1" => Some(Severity::High),
            "medium" | "moderate" | "warning" | "p2" => Some(Severity::Medium),
            "low" | "minor" | "info" | "nit" | "p3" => Some(Severity::Low),
            _ => None,
        }
    }

    /// Critical or High: always a remediation target.
    pub fn is_high_or_worse(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        };
        write!(f, "{}", s)
    }
}

/// A single finding carried by a phase result.
///
/// Severity is fixed at extraction time; a later fix attempt yields a new
/// result with its own issue list instead of re-grading this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default = "default_fixable")]
    pub fixable: bool,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_fixable() -> bool {
    true
}

impl Issue {
    pub fn new(category: &str, severity: Severity, description: &str) -> Self {
        Self {
            category: category.to_string(),
            severity,
            description: description.to_string(),
            location: None,
            fixable: true,
        }
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    pub fn not_fixable(mut self) -> Self {
        self.fixable = false;
        self
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.description)?;
        if let Some(loc) = &self.location {
            write!(f, " ({})", loc)?;
        }
        Ok(())
    }
}

/// Test run counts scraped from agent output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
}

/// Requirement coverage for the traceability phase, as percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    /// Coverage of top-priority (P0) requirements.
    pub top_tier: f64,
    /// Coverage of next-tier (P1) requirements.
    pub next_tier: f64,
}

/// Acceptance scenario outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioCounts {
    pub passed: u32,
    pub failed: u32,
    /// Scenarios that need a human and are excluded from the gate.
    #[serde(default)]
    pub manual: u32,
}

/// Which extraction strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    FencedBlock,
    ResultBlock,
    InlineObject,
    SignalLine,
    Fuzzy,
    /// Synthesized from an invocation outcome (timeout, spawn failure).
    Invocation,
}

/// The immutable outcome of one phase invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: PhaseType,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<Coverage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenarios: Option<ScenarioCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub source: ExtractionSource,
}

impl PhaseResult {
    pub fn new(phase: PhaseType, status: PhaseStatus, source: ExtractionSource) -> Self {
        Self {
            phase,
            status,
            score: None,
            issues: Vec::new(),
            tests: None,
            coverage: None,
            scenarios: None,
            summary: None,
            source,
        }
    }

    pub fn with_score(mut self, score: u8) -> Self {
        self.score = Some(score.min(100));
        self
    }

    pub fn with_issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_tests(mut self, tests: TestCounts) -> Self {
        self.tests = Some(tests);
        self
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = Some(coverage);
        self
    }

    pub fn with_scenarios(mut self, scenarios: ScenarioCounts) -> Self {
        self.scenarios = Some(scenarios);
        self
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    pub fn count_at(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    pub fn has_severity_at_least(&self, severity: Severity) -> bool {
        self.issues.iter().any(|i| i.severity <= severity)
    }

    /// One-line description used in logs and hand-off prompts.
    pub fn brief(&self) -> String {
        let mut parts = vec![format!("{} {}", self.phase, self.status)];
        if let Some(score) = self.score {
            parts.push(format!("score {}", score));
        }
        if !self.issues.is_empty() {
            parts.push(format!(
                "{} issue{}",
                self.issues.len(),
                if self.issues.len() == 1 { "" } else { "s" }
            ));
        }
        if let Some(tests) = self.tests {
            parts.push(format!("{} passed/{} failed", tests.passed, tests.failed));
        }
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_key_roundtrip() {
        for phase in PhaseType::ALL {
            assert_eq!(PhaseType::from_key(phase.key()), Some(phase));
        }
        assert_eq!(PhaseType::from_key("code-review"), Some(PhaseType::CodeReview));
        assert_eq!(PhaseType::from_key("deploy"), None);
    }

    #[test]
    fn test_status_words() {
        assert_eq!(PhaseStatus::parse_word("PASSED"), Some(PhaseStatus::Complete));
        assert_eq!(PhaseStatus::parse_word("\"complete\""), Some(PhaseStatus::Complete));
        assert_eq!(PhaseStatus::parse_word("changes requested"), Some(PhaseStatus::Failed));
        assert_eq!(
            PhaseStatus::parse_word("PASS_WITH_CONCERNS"),
            Some(PhaseStatus::Concerns)
        );
        assert_eq!(PhaseStatus::parse_word("Blocked"), Some(PhaseStatus::Blocked));
        assert_eq!(PhaseStatus::parse_word("maybe"), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::High < Severity::Medium);
        assert!(Severity::Critical.is_high_or_worse());
        assert!(!Severity::Medium.is_high_or_worse());
        assert_eq!(Severity::parse_word("Major"), Some(Severity::High));
    }

    #[test]
    fn test_issue_deserialize_defaults() {
        let issue: Issue = serde_json::from_str(r#"{"description": "x"}"#).unwrap();
        assert_eq!(issue.category, "general");
        assert_eq!(issue.severity, Severity::Medium);
        assert!(issue.fixable);
    }

    #[test]
    fn test_result_helpers() {
        let result = PhaseResult::new(PhaseType::CodeReview, PhaseStatus::Concerns, ExtractionSource::Fuzzy)
            .with_score(140)
            .with_issues(vec![
                Issue::new("style", Severity::Low, "naming"),
                Issue::new("bug", Severity::High, "off by one"),
            ]);
        assert_eq!(result.score, Some(100));
        assert_eq!(result.count_at(Severity::High), 1);
        assert!(result.has_severity_at_least(Severity::High));
        assert!(!result.has_severity_at_least(Severity::Critical));
        assert!(result.brief().contains("2 issues"));
    }
}
