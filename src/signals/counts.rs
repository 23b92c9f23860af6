//! Numeric signals scraped from free text.
//!
//! - Jest: `Tests: 1 failed, 5 passed, 6 total`
//! - cargo: `test result: ok. 5 passed; 0 failed; ...` (summed across binaries)
//! - pytest: `5 passed, 1 failed in 0.42s`
//! - score: `Quality score: 72` or `score: 72/100`
//! - coverage: `P0 coverage: 100%` and `P1 coverage: 92%`
//! - scenarios: `Scenarios: 8 passed, 1 failed, 2 manual`

use crate::phase::{Coverage, ScenarioCounts, TestCounts};
use regex::Regex;
use std::sync::LazyLock;

static JEST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Tests:\s+(?:(\d+)\s+failed,\s+)?(?:\d+\s+skipped,\s+)?(\d+)\s+passed(?:,\s+(\d+)\s+total)?",
    )
    .unwrap()
});

static CARGO_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").unwrap()
});

static PYTEST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(\d+) failed, )?(\d+) passed(?:, (\d+) failed)?[^\n]*? in \d+(?:\.\d+)?s")
        .unwrap()
});

static SCORE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bscore\s*[:=]\s*\**\s*(\d{1,3})(?:\s*/\s*100)?").unwrap()
});

static P0_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bP0\s+coverage\s*[:=]\s*(\d{1,3}(?:\.\d+)?)\s*%").unwrap()
});

static P1_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bP1\s+coverage\s*[:=]\s*(\d{1,3}(?:\.\d+)?)\s*%").unwrap()
});

static SCENARIO_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bscenarios?\s*:\s*(\d+)\s+passed(?:,\s*(\d+)\s+failed)?(?:,\s*(\d+)\s+manual)?",
    )
    .unwrap()
});

fn number(cap: Option<regex::Match<'_>>) -> u32 {
    cap.and_then(|m| m.as_str().parse().ok()).unwrap_or(0)
}

/// Test counts from the last recognized runner summary.
pub fn scrape_test_counts(text: &str) -> Option<TestCounts> {
    if let Some(cap) = JEST_REGEX.captures_iter(text).last() {
        return Some(TestCounts {
            passed: number(cap.get(2)),
            failed: number(cap.get(1)),
            total: cap.get(3).and_then(|m| m.as_str().parse().ok()),
        });
    }

    let cargo: Vec<_> = CARGO_REGEX.captures_iter(text).collect();
    if !cargo.is_empty() {
        let passed = cargo.iter().map(|c| number(c.get(1))).sum();
        let failed = cargo.iter().map(|c| number(c.get(2))).sum();
        return Some(TestCounts {
            passed,
            failed,
            total: Some(passed + failed),
        });
    }

    PYTEST_REGEX.captures_iter(text).last().map(|cap| {
        let failed = number(cap.get(1)) + number(cap.get(3));
        TestCounts {
            passed: number(cap.get(2)),
            failed,
            total: None,
        }
    })
}

/// Last `score: N` value, clamped to 100.
pub fn scrape_score(text: &str) -> Option<u8> {
    SCORE_REGEX
        .captures_iter(text)
        .last()
        .and_then(|cap| cap.get(1)?.as_str().parse::<u32>().ok())
        .map(|s| s.min(100) as u8)
}

/// Both tiers are required; a lone P0 figure is not enough to gate on.
pub fn scrape_coverage(text: &str) -> Option<Coverage> {
    let top = P0_REGEX.captures_iter(text).last()?;
    let next = P1_REGEX.captures_iter(text).last()?;
    Some(Coverage {
        top_tier: top.get(1)?.as_str().parse().ok()?,
        next_tier: next.get(1)?.as_str().parse().ok()?,
    })
}

pub fn scrape_scenarios(text: &str) -> Option<ScenarioCounts> {
    SCENARIO_REGEX
        .captures_iter(text)
        .last()
        .map(|cap| ScenarioCounts {
            passed: number(cap.get(1)),
            failed: number(cap.get(2)),
            manual: number(cap.get(3)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jest_passed_only() {
        let counts = scrape_test_counts("Ran all suites.\nTests: 5 passed\n").unwrap();
        assert_eq!(counts.passed, 5);
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.total, None);
    }

    #[test]
    fn test_jest_full_summary() {
        let counts = scrape_test_counts("Tests:       1 failed, 2 skipped, 9 passed, 12 total").unwrap();
        assert_eq!(counts.passed, 9);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total, Some(12));
    }

    #[test]
    fn test_cargo_sums_binaries() {
        let text = "test result: ok. 3 passed; 0 failed; 0 ignored\n\
                    test result: FAILED. 4 passed; 2 failed; 0 ignored";
        let counts = scrape_test_counts(text).unwrap();
        assert_eq!(counts.passed, 7);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.total, Some(9));
    }

    #[test]
    fn test_pytest_summary() {
        let counts = scrape_test_counts("===== 1 failed, 10 passed in 0.42s =====").unwrap();
        assert_eq!(counts.passed, 10);
        assert_eq!(counts.failed, 1);
    }

    #[test]
    fn test_no_counts() {
        assert!(scrape_test_counts("nothing ran").is_none());
    }

    #[test]
    fn test_score_variants() {
        assert_eq!(scrape_score("Quality score: 72"), Some(72));
        assert_eq!(scrape_score("score = 85/100"), Some(85));
        assert_eq!(scrape_score("first score: 40, final score: 65"), Some(65));
        assert_eq!(scrape_score("score: 250"), Some(100));
        assert_eq!(scrape_score("no number here"), None);
    }

    #[test]
    fn test_coverage_needs_both_tiers() {
        let cov = scrape_coverage("P0 coverage: 100%\nP1 coverage: 87.5%").unwrap();
        assert_eq!(cov.top_tier, 100.0);
        assert_eq!(cov.next_tier, 87.5);
        assert!(scrape_coverage("P0 coverage: 100%").is_none());
    }

    #[test]
    fn test_scenarios() {
        let s = scrape_scenarios("Scenarios: 8 passed, 1 failed, 2 manual").unwrap();
        assert_eq!((s.passed, s.failed, s.manual), (8, 1, 2));
        let s = scrape_scenarios("scenarios: 4 passed").unwrap();
        assert_eq!(s.failed, 0);
    }
}
