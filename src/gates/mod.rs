//! Quality gates: a pure mapping from a finalized phase result to a verdict.
//!
//! The evaluator never mutates the result it reads. Callers copy the verdict
//! into the record that owns it (story record or epic metrics).

use crate::phase::{PhaseResult, PhaseStatus, PhaseType, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateVerdict {
    Pass,
    Concerns,
    Fail,
    Blocked,
}

impl GateVerdict {
    pub fn is_failing(&self) -> bool {
        matches!(self, GateVerdict::Fail | GateVerdict::Blocked)
    }
}

impl fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateVerdict::Pass => "PASS",
            GateVerdict::Concerns => "CONCERNS",
            GateVerdict::Fail => "FAIL",
            GateVerdict::Blocked => "BLOCKED",
        };
        write!(f, "{}", s)
    }
}

/// Threshold policy for the numeric gates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    /// Minimum test-quality score for a pass.
    pub test_quality_pass: u8,
    /// Minimum test-quality score for concerns; below it the gate fails.
    pub test_quality_concerns: u8,
    /// Code review passes with at most this many (non-High) issues.
    pub review_issue_threshold: usize,
    /// Required top-tier requirement coverage, in percent.
    pub traceability_top_tier: f64,
    /// Next-tier coverage needed for a pass.
    pub traceability_next_pass: f64,
    /// Next-tier coverage needed for concerns.
    pub traceability_next_concerns: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            test_quality_pass: 70,
            test_quality_concerns: 60,
            review_issue_threshold: 5,
            traceability_top_tier: 100.0,
            traceability_next_pass: 90.0,
            traceability_next_concerns: 80.0,
        }
    }
}

impl GateThresholds {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.test_quality_pass > 100 {
            errors.push("gates.test_quality_pass must be <= 100".to_string());
        }
        if self.test_quality_concerns > self.test_quality_pass {
            errors.push("gates.test_quality_concerns must not exceed test_quality_pass".to_string());
        }
        for (name, value) in [
            ("traceability_top_tier", self.traceability_top_tier),
            ("traceability_next_pass", self.traceability_next_pass),
            ("traceability_next_concerns", self.traceability_next_concerns),
        ] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!("gates.{} must be between 0 and 100", name));
            }
        }
        if self.traceability_next_concerns > self.traceability_next_pass {
            errors.push(
                "gates.traceability_next_concerns must not exceed traceability_next_pass"
                    .to_string(),
            );
        }
        errors
    }
}

/// Verdict implied by the status alone.
fn status_verdict(status: PhaseStatus) -> GateVerdict {
    match status {
        PhaseStatus::Complete => GateVerdict::Pass,
        PhaseStatus::Concerns => GateVerdict::Concerns,
        PhaseStatus::Blocked => GateVerdict::Blocked,
        PhaseStatus::Failed | PhaseStatus::Unclear => GateVerdict::Fail,
    }
}

/// Map a finalized result onto a verdict.
pub fn evaluate(result: &PhaseResult, thresholds: &GateThresholds) -> GateVerdict {
    let base = status_verdict(result.status);
    if matches!(base, GateVerdict::Blocked | GateVerdict::Fail) {
        return base;
    }

    let phase_verdict = match result.phase {
        PhaseType::Dev | PhaseType::AcceptanceDoc => base,
        PhaseType::ArchCompliance => {
            if result.has_severity_at_least(Severity::High) {
                GateVerdict::Fail
            } else if result.count_at(Severity::Medium) > 0 {
                GateVerdict::Concerns
            } else {
                GateVerdict::Pass
            }
        }
        PhaseType::CodeReview => {
            if result.has_severity_at_least(Severity::High) {
                GateVerdict::Fail
            } else if result.issues.len() > thresholds.review_issue_threshold {
                GateVerdict::Concerns
            } else {
                GateVerdict::Pass
            }
        }
        PhaseType::TestQuality => {
            if result.has_severity_at_least(Severity::Critical) {
                GateVerdict::Fail
            } else {
                match result.score {
                    Some(score) if score >= thresholds.test_quality_pass => GateVerdict::Pass,
                    Some(score) if score >= thresholds.test_quality_concerns => {
                        GateVerdict::Concerns
                    }
                    Some(_) => GateVerdict::Fail,
                    None => GateVerdict::Concerns,
                }
            }
        }
        PhaseType::Traceability => match result.coverage {
            Some(coverage) if coverage.top_tier < thresholds.traceability_top_tier => {
                GateVerdict::Fail
            }
            Some(coverage) if coverage.next_tier >= thresholds.traceability_next_pass => {
                GateVerdict::Pass
            }
            Some(coverage) if coverage.next_tier >= thresholds.traceability_next_concerns => {
                GateVerdict::Concerns
            }
            Some(_) => GateVerdict::Fail,
            None => GateVerdict::Concerns,
        },
        PhaseType::AcceptanceGate => match result.scenarios {
            Some(scenarios) if scenarios.failed > 0 => GateVerdict::Fail,
            Some(_) => GateVerdict::Pass,
            None => base,
        },
    };

    // A self-reported Concerns never upgrades to Pass.
    phase_verdict.max(base)
}

/// The most severe verdict in `verdicts`, or Pass when empty.
pub fn worst<I>(verdicts: I) -> GateVerdict
where
    I: IntoIterator<Item = GateVerdict>,
{
    verdicts.into_iter().max().unwrap_or(GateVerdict::Pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Coverage, ExtractionSource, Issue, ScenarioCounts};

    fn result(phase: PhaseType, status: PhaseStatus) -> PhaseResult {
        PhaseResult::new(phase, status, ExtractionSource::FencedBlock)
    }

    #[test]
    fn test_blocked_status_blocks_every_phase() {
        for phase in PhaseType::ALL {
            assert_eq!(
                evaluate(&result(phase, PhaseStatus::Blocked), &GateThresholds::default()),
                GateVerdict::Blocked
            );
        }
    }

    #[test]
    fn test_failed_and_unclear_always_fail() {
        let t = GateThresholds::default();
        let failed = result(PhaseType::TestQuality, PhaseStatus::Failed).with_score(95);
        assert_eq!(evaluate(&failed, &t), GateVerdict::Fail);
        assert_eq!(evaluate(&result(PhaseType::Dev, PhaseStatus::Unclear), &t), GateVerdict::Fail);
    }

    #[test]
    fn test_arch_compliance_clean_passes() {
        let r = result(PhaseType::ArchCompliance, PhaseStatus::Complete)
            .with_issues(vec![Issue::new("style", Severity::Low, "nit")]);
        assert_eq!(evaluate(&r, &GateThresholds::default()), GateVerdict::Pass);
    }

    #[test]
    fn test_arch_compliance_medium_is_concerns_high_fails() {
        let t = GateThresholds::default();
        let medium = result(PhaseType::ArchCompliance, PhaseStatus::Complete)
            .with_issues(vec![Issue::new("layering", Severity::Medium, "leak")]);
        assert_eq!(evaluate(&medium, &t), GateVerdict::Concerns);
        let high = result(PhaseType::ArchCompliance, PhaseStatus::Complete)
            .with_issues(vec![Issue::new("layering", Severity::High, "cycle")]);
        assert_eq!(evaluate(&high, &t), GateVerdict::Fail);
    }

    #[test]
    fn test_code_review_issue_threshold() {
        let t = GateThresholds::default();
        let issues = |n: usize| {
            (0..n)
                .map(|i| Issue::new("style", Severity::Medium, &format!("n{}", i)))
                .collect::<Vec<_>>()
        };
        let few = result(PhaseType::CodeReview, PhaseStatus::Complete).with_issues(issues(5));
        assert_eq!(evaluate(&few, &t), GateVerdict::Pass);
        let many = result(PhaseType::CodeReview, PhaseStatus::Complete).with_issues(issues(6));
        assert_eq!(evaluate(&many, &t), GateVerdict::Concerns);
    }

    #[test]
    fn test_test_quality_score_bands() {
        let t = GateThresholds::default();
        let at = |score| {
            evaluate(&result(PhaseType::TestQuality, PhaseStatus::Complete).with_score(score), &t)
        };
        assert_eq!(at(70), GateVerdict::Pass);
        assert_eq!(at(69), GateVerdict::Concerns);
        assert_eq!(at(60), GateVerdict::Concerns);
        assert_eq!(at(59), GateVerdict::Fail);
    }

    #[test]
    fn test_test_quality_score_55_with_critical_fails() {
        let r = result(PhaseType::TestQuality, PhaseStatus::Concerns)
            .with_score(55)
            .with_issues(vec![Issue::new("flaky", Severity::Critical, "sleeps in tests")]);
        assert_eq!(evaluate(&r, &GateThresholds::default()), GateVerdict::Fail);
    }

    #[test]
    fn test_critical_fails_even_with_high_score() {
        let r = result(PhaseType::TestQuality, PhaseStatus::Complete)
            .with_score(90)
            .with_issues(vec![Issue::new("flaky", Severity::Critical, "order dependent")]);
        assert_eq!(evaluate(&r, &GateThresholds::default()), GateVerdict::Fail);
    }

    #[test]
    fn test_missing_metric_is_concerns() {
        let t = GateThresholds::default();
        assert_eq!(
            evaluate(&result(PhaseType::TestQuality, PhaseStatus::Complete), &t),
            GateVerdict::Concerns
        );
        assert_eq!(
            evaluate(&result(PhaseType::Traceability, PhaseStatus::Complete), &t),
            GateVerdict::Concerns
        );
    }

    #[test]
    fn test_traceability_tiers() {
        let t = GateThresholds::default();
        let at = |top, next| {
            evaluate(
                &result(PhaseType::Traceability, PhaseStatus::Complete).with_coverage(Coverage {
                    top_tier: top,
                    next_tier: next,
                }),
                &t,
            )
        };
        assert_eq!(at(100.0, 95.0), GateVerdict::Pass);
        assert_eq!(at(100.0, 85.0), GateVerdict::Concerns);
        assert_eq!(at(100.0, 70.0), GateVerdict::Fail);
        assert_eq!(at(98.0, 100.0), GateVerdict::Fail);
    }

    #[test]
    fn test_acceptance_gate_scenarios() {
        let t = GateThresholds::default();
        let ok = result(PhaseType::AcceptanceGate, PhaseStatus::Complete).with_scenarios(
            ScenarioCounts {
                passed: 4,
                failed: 0,
                manual: 2,
            },
        );
        assert_eq!(evaluate(&ok, &t), GateVerdict::Pass);
        let bad = result(PhaseType::AcceptanceGate, PhaseStatus::Complete).with_scenarios(
            ScenarioCounts {
                passed: 4,
                failed: 1,
                manual: 0,
            },
        );
        assert_eq!(evaluate(&bad, &t), GateVerdict::Fail);
    }

    #[test]
    fn test_self_reported_concerns_not_upgraded() {
        let r = result(PhaseType::ArchCompliance, PhaseStatus::Concerns);
        assert_eq!(evaluate(&r, &GateThresholds::default()), GateVerdict::Concerns);
    }

    #[test]
    fn test_evaluate_is_idempotent_and_pure() {
        let t = GateThresholds::default();
        let r = result(PhaseType::CodeReview, PhaseStatus::Complete)
            .with_issues(vec![Issue::new("naming", Severity::Low, "x")]);
        let before = r.clone();
        let first = evaluate(&r, &t);
        for _ in 0..5 {
            assert_eq!(evaluate(&r, &t), first);
        }
        assert_eq!(r, before);
    }

    #[test]
    fn test_worst() {
        assert_eq!(worst([]), GateVerdict::Pass);
        assert_eq!(
            worst([GateVerdict::Pass, GateVerdict::Concerns, GateVerdict::Pass]),
            GateVerdict::Concerns
        );
        assert_eq!(worst([GateVerdict::Fail, GateVerdict::Blocked]), GateVerdict::Blocked);
    }

    #[test]
    fn test_thresholds_validate() {
        assert!(GateThresholds::default().validate().is_empty());
        let bad = GateThresholds {
            test_quality_concerns: 80,
            ..Default::default()
        };
        assert_eq!(bad.validate().len(), 1);
    }

    #[test]
    fn test_verdict_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&GateVerdict::Concerns).unwrap(), "\"CONCERNS\"");
    }
}
