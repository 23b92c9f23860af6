//! Fuzzy classification vocabularies.
//!
//! Each phase has three term sets. A term matches at the start of a word, so
//! `fail` also matches `failed` and `failing`. A blocking term preceded by a
//! negation (`no errors`, `0 failed`) does not count.

use crate::phase::{PhaseStatus, PhaseType};
use regex::Regex;
use std::sync::LazyLock;

/// Bump when any table below changes; recorded in logs next to fuzzy verdicts.
pub const VOCABULARY_VERSION: u32 = 1;

#[derive(Debug)]
pub struct Vocabulary {
    pub phase: PhaseType,
    pub completion: &'static [&'static str],
    /// Must co-occur with a completion term. Empty means no subject needed.
    pub subject: &'static [&'static str],
    pub blocking: &'static [&'static str],
}

pub static VOCABULARIES: [Vocabulary; 7] = [
    Vocabulary {
        phase: PhaseType::Dev,
        completion: &["complete", "done", "finished", "success"],
        subject: &["implementation", "story"],
        blocking: &["block", "fail", "error", "cannot", "unable"],
    },
    Vocabulary {
        phase: PhaseType::ArchCompliance,
        completion: &["compliant", "no violations", "passed", "approved"],
        subject: &["architecture", "compliance", "design"],
        blocking: &["violation", "block", "fail", "cannot"],
    },
    Vocabulary {
        phase: PhaseType::CodeReview,
        completion: &["approved", "lgtm", "looks good", "passed", "complete"],
        subject: &["review", "code", "changes"],
        blocking: &["changes requested", "reject", "fail", "block"],
    },
    Vocabulary {
        phase: PhaseType::TestQuality,
        completion: &["passed", "meets", "complete", "approved"],
        subject: &["test", "quality", "suite"],
        blocking: &["fail", "block", "insufficient", "flaky"],
    },
    Vocabulary {
        phase: PhaseType::Traceability,
        completion: &["complete", "fully traced", "full coverage", "passed"],
        subject: &["trace", "coverage", "requirement"],
        blocking: &["gap", "missing", "uncovered", "fail"],
    },
    Vocabulary {
        phase: PhaseType::AcceptanceDoc,
        completion: &["generated", "created", "written", "complete"],
        subject: &["acceptance", "document", "uat"],
        blocking: &["fail", "cannot", "unable", "error"],
    },
    Vocabulary {
        phase: PhaseType::AcceptanceGate,
        completion: &["all scenarios pass", "passed", "accepted"],
        subject: &[],
        blocking: &["fail", "reject", "block"],
    },
];

struct CompiledVocabulary {
    completion: Regex,
    subject: Option<Regex>,
    blocking: Regex,
}

fn term_regex(terms: &[&str]) -> Regex {
    let alternatives: Vec<String> = terms.iter().map(|t| regex::escape(t)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\w*", alternatives.join("|"))).unwrap()
}

static COMPILED: LazyLock<Vec<CompiledVocabulary>> = LazyLock::new(|| {
    VOCABULARIES
        .iter()
        .map(|v| CompiledVocabulary {
            completion: term_regex(v.completion),
            subject: (!v.subject.is_empty()).then(|| term_regex(v.subject)),
            blocking: term_regex(v.blocking),
        })
        .collect()
});

const NEGATIONS: [&str; 6] = ["no", "not", "without", "zero", "0", "never"];

pub fn vocabulary_for(phase: PhaseType) -> &'static Vocabulary {
    let idx = VOCABULARIES
        .iter()
        .position(|v| v.phase == phase)
        .unwrap_or(0);
    &VOCABULARIES[idx]
}

fn compiled_for(phase: PhaseType) -> &'static CompiledVocabulary {
    let idx = VOCABULARIES
        .iter()
        .position(|v| v.phase == phase)
        .unwrap_or(0);
    &COMPILED[idx]
}

/// The word immediately before `offset`, lowercased.
fn preceding_word(text: &str, offset: usize) -> String {
    text[..offset]
        .split_whitespace()
        .next_back()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

fn has_unnegated_match(re: &Regex, text: &str) -> bool {
    re.find_iter(text)
        .any(|m| !NEGATIONS.contains(&preceding_word(text, m.start()).as_str()))
}

/// Classify free text for a phase.
///
/// Blocking terms are checked first so mixed text never reads as success.
pub fn classify(text: &str, phase: PhaseType) -> PhaseStatus {
    let vocab = compiled_for(phase);

    if has_unnegated_match(&vocab.blocking, text) {
        return PhaseStatus::Failed;
    }

    let completed = vocab.completion.is_match(text);
    let subject_present = vocab
        .subject
        .as_ref()
        .is_none_or(|subject| subject.is_match(text));

    if completed && subject_present {
        PhaseStatus::Complete
    } else {
        PhaseStatus::Unclear
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_phase_has_a_vocabulary() {
        for phase in PhaseType::ALL {
            assert_eq!(vocabulary_for(phase).phase, phase);
        }
    }

    #[test]
    fn test_dev_completion_needs_subject() {
        assert_eq!(
            classify("The story implementation is complete.", PhaseType::Dev),
            PhaseStatus::Complete
        );
        assert_eq!(classify("All done here.", PhaseType::Dev), PhaseStatus::Unclear);
    }

    #[test]
    fn test_dev_blocking_terms() {
        assert_eq!(
            classify("I was unable to run the migrations", PhaseType::Dev),
            PhaseStatus::Failed
        );
        assert_eq!(
            classify("Build FAILED with 3 errors", PhaseType::Dev),
            PhaseStatus::Failed
        );
    }

    #[test]
    fn test_blocking_wins_over_completion() {
        assert_eq!(
            classify("Story implementation complete but the build failed", PhaseType::Dev),
            PhaseStatus::Failed
        );
    }

    #[test]
    fn test_negated_blocking_terms_are_ignored() {
        assert_eq!(
            classify(
                "Implementation finished with no errors. Tests: 5 passed, 0 failed",
                PhaseType::Dev
            ),
            PhaseStatus::Complete
        );
    }

    #[test]
    fn test_neither_vocabulary_is_unclear() {
        assert_eq!(
            classify("Let me look at the repository layout first.", PhaseType::Dev),
            PhaseStatus::Unclear
        );
    }

    #[test]
    fn test_phase_without_subject_set() {
        assert_eq!(
            classify("Accepted by the product owner", PhaseType::AcceptanceGate),
            PhaseStatus::Complete
        );
    }

    #[test]
    fn test_review_multiword_terms() {
        assert_eq!(
            classify("Reviewer verdict: changes requested on auth module", PhaseType::CodeReview),
            PhaseStatus::Failed
        );
        assert_eq!(
            classify("Code review: LGTM", PhaseType::CodeReview),
            PhaseStatus::Complete
        );
    }
}
