//! Severity-gated remediation policy.
//!
//! `decide` is a pure function from a result and the number of fix attempts
//! already made to the next step of the loop.

use crate::phase::{Issue, PhaseResult, PhaseStatus, PhaseType, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-phase fix-loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixPolicy {
    /// Fix attempts allowed after the initial invocation.
    pub max_attempts: u32,
    /// Medium issues become targets once the open issue count exceeds this.
    pub medium_issue_threshold: usize,
    /// A failing verdict after the loop blocks the story.
    pub hard_blocking: bool,
    /// Further attempts granted after an invocation timed out.
    pub timeout_retries: u32,
}

impl FixPolicy {
    /// Built-in defaults. Caps differ per phase and stay configurable.
    pub fn default_for(phase: PhaseType) -> Self {
        let (max_attempts, hard_blocking) = match phase {
            PhaseType::Dev => (2, true),
            PhaseType::ArchCompliance => (3, true),
            PhaseType::CodeReview => (3, true),
            PhaseType::TestQuality => (3, false),
            PhaseType::Traceability => (3, false),
            PhaseType::AcceptanceDoc => (2, false),
            PhaseType::AcceptanceGate => (2, false),
        };
        Self {
            max_attempts,
            medium_issue_threshold: 5,
            hard_blocking,
            timeout_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixReason {
    /// Actionable issues are open.
    Issues,
    /// The phase reported failure without listing issues.
    PhaseFailed,
    /// No confident result could be extracted.
    UnclearResult,
    /// The result is below the phase's gate threshold.
    BelowGate,
}

impl fmt::Display for FixReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixReason::Issues => write!(f, "open issues"),
            FixReason::PhaseFailed => write!(f, "phase failed"),
            FixReason::UnclearResult => write!(f, "unclear result"),
            FixReason::BelowGate => write!(f, "below gate threshold"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FixDecision {
    Accept,
    /// Nothing actionable, but these issues are documented.
    AcceptWithIssues(Vec<Issue>),
    Fix {
        attempt: u32,
        targets: Vec<Issue>,
        reason: FixReason,
    },
    /// Still actionable with no attempts left.
    Exhausted { open: Vec<Issue>, reason: FixReason },
    /// The agent reported it is blocked; retrying will not help.
    Blocked,
}

/// Issues the policy wants fixed.
///
/// Critical and High always qualify. Medium qualifies only when the total
/// open issue count exceeds the threshold. Low never does. Unfixable issues
/// are documented, not targeted.
pub fn actionable_issues(result: &PhaseResult, policy: &FixPolicy) -> Vec<Issue> {
    let include_medium = result.issues.len() > policy.medium_issue_threshold;
    result
        .issues
        .iter()
        .filter(|issue| issue.fixable)
        .filter(|issue| match issue.severity {
            Severity::Critical | Severity::High => true,
            Severity::Medium => include_medium,
            Severity::Low => false,
        })
        .cloned()
        .collect()
}

pub fn decide(result: &PhaseResult, policy: &FixPolicy, attempts_made: u32) -> FixDecision {
    if result.status == PhaseStatus::Blocked {
        return FixDecision::Blocked;
    }

    let targets = actionable_issues(result, policy);
    let reason = if !targets.is_empty() {
        Some(FixReason::Issues)
    } else {
        match result.status {
            PhaseStatus::Failed => Some(FixReason::PhaseFailed),
            PhaseStatus::Unclear => Some(FixReason::UnclearResult),
            _ => None,
        }
    };

    let Some(reason) = reason else {
        return if result.issues.is_empty() {
            FixDecision::Accept
        } else {
            FixDecision::AcceptWithIssues(result.issues.clone())
        };
    };

    if attempts_made >= policy.max_attempts {
        FixDecision::Exhausted {
            open: targets,
            reason,
        }
    } else {
        FixDecision::Fix {
            attempt: attempts_made + 1,
            targets,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::ExtractionSource;

    fn result(status: PhaseStatus, issues: Vec<Issue>) -> PhaseResult {
        PhaseResult::new(PhaseType::ArchCompliance, status, ExtractionSource::FencedBlock)
            .with_issues(issues)
    }

    fn issues(severity: Severity, n: usize) -> Vec<Issue> {
        (0..n)
            .map(|i| Issue::new("test", severity, &format!("issue {}", i)))
            .collect()
    }

    #[test]
    fn test_clean_result_is_accepted() {
        let policy = FixPolicy::default_for(PhaseType::ArchCompliance);
        assert_eq!(decide(&result(PhaseStatus::Complete, vec![]), &policy, 0), FixDecision::Accept);
    }

    #[test]
    fn test_high_always_targeted() {
        let policy = FixPolicy::default_for(PhaseType::ArchCompliance);
        let decision = decide(&result(PhaseStatus::Concerns, issues(Severity::High, 1)), &policy, 0);
        assert!(matches!(
            decision,
            FixDecision::Fix { attempt: 1, ref targets, reason: FixReason::Issues } if targets.len() == 1
        ));
    }

    #[test]
    fn test_medium_below_threshold_documented() {
        let policy = FixPolicy::default_for(PhaseType::CodeReview);
        let decision = decide(&result(PhaseStatus::Concerns, issues(Severity::Medium, 5)), &policy, 0);
        assert!(matches!(decision, FixDecision::AcceptWithIssues(ref i) if i.len() == 5));
    }

    #[test]
    fn test_medium_above_threshold_targeted() {
        let policy = FixPolicy::default_for(PhaseType::CodeReview);
        let mut all = issues(Severity::Medium, 4);
        all.extend(issues(Severity::Low, 2));
        let decision = decide(&result(PhaseStatus::Concerns, all), &policy, 0);
        match decision {
            FixDecision::Fix { targets, .. } => {
                assert_eq!(targets.len(), 4);
                assert!(targets.iter().all(|i| i.severity == Severity::Medium));
            }
            other => panic!("expected Fix, got {:?}", other),
        }
    }

    #[test]
    fn test_low_never_targeted() {
        let policy = FixPolicy::default_for(PhaseType::CodeReview);
        let decision = decide(&result(PhaseStatus::Concerns, issues(Severity::Low, 20)), &policy, 0);
        assert!(matches!(decision, FixDecision::AcceptWithIssues(_)));
    }

    #[test]
    fn test_unfixable_high_is_documented() {
        let policy = FixPolicy::default_for(PhaseType::CodeReview);
        let issue = Issue::new("infra", Severity::High, "needs ops").not_fixable();
        let decision = decide(&result(PhaseStatus::Concerns, vec![issue]), &policy, 0);
        assert!(matches!(decision, FixDecision::AcceptWithIssues(_)));
    }

    #[test]
    fn test_unclear_and_failed_are_retryable() {
        let policy = FixPolicy::default_for(PhaseType::Dev);
        assert!(matches!(
            decide(&result(PhaseStatus::Unclear, vec![]), &policy, 0),
            FixDecision::Fix { reason: FixReason::UnclearResult, .. }
        ));
        assert!(matches!(
            decide(&result(PhaseStatus::Failed, vec![]), &policy, 1),
            FixDecision::Fix { attempt: 2, reason: FixReason::PhaseFailed, .. }
        ));
    }

    #[test]
    fn test_exhausted_at_max_attempts() {
        let policy = FixPolicy::default_for(PhaseType::Dev);
        let decision = decide(&result(PhaseStatus::Failed, issues(Severity::Critical, 1)), &policy, 2);
        assert!(matches!(decision, FixDecision::Exhausted { ref open, .. } if open.len() == 1));
    }

    #[test]
    fn test_blocked_is_terminal() {
        let policy = FixPolicy::default_for(PhaseType::Dev);
        assert_eq!(
            decide(&result(PhaseStatus::Blocked, issues(Severity::High, 3)), &policy, 0),
            FixDecision::Blocked
        );
    }

    #[test]
    fn test_attempt_numbers_strictly_increase_and_stay_bounded() {
        let policy = FixPolicy::default_for(PhaseType::CodeReview);
        let failing = result(PhaseStatus::Failed, issues(Severity::High, 1));
        let mut last = 0;
        for made in 0..10 {
            match decide(&failing, &policy, made) {
                FixDecision::Fix { attempt, .. } => {
                    assert!(attempt > last);
                    assert!(attempt <= policy.max_attempts);
                    last = attempt;
                }
                FixDecision::Exhausted { .. } => assert!(made >= policy.max_attempts),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(last, policy.max_attempts);
    }
}
