//! Strategy chain that turns raw agent output into a `PhaseResult`.
//!
//! Strategies run in order and the first success wins. Within a strategy the
//! last candidate in the text is authoritative, since the agent may think out
//! loud before emitting its final answer. A candidate that fails to parse or
//! carries an unknown status is recorded and skipped, never fatal.

use super::counts::{scrape_coverage, scrape_scenarios, scrape_score, scrape_test_counts};
use super::vocabulary::{VOCABULARY_VERSION, classify};
use crate::errors::ExtractionError;
use crate::phase::{
    Coverage, ExtractionSource, Issue, PhaseResult, PhaseStatus, PhaseType, ScenarioCounts,
    Severity, TestCounts,
};
use crate::util::find_json_objects;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::sync::LazyLock;

/// Info strings of fenced blocks tried first.
const PRIMARY_MARKERS: [&str; 5] = ["yaml", "yml", "json", "signal", "epicflow"];

/// Info strings of the second fenced variant.
const RESULT_MARKERS: [&str; 2] = ["result", "phase-result"];

static FENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([A-Za-z0-9_-]*)[^\n]*\n(.*?)^[ \t]*```[ \t]*\r?$").unwrap()
});

// TOKEN: STATUS[ - detail], tolerating markdown emphasis around either side.
static SIGNAL_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t>*#`-]*([A-Z][A-Z0-9_]*)[*`]*[ \t]*:[ \t]*[*`]*([A-Za-z_]+(?:[ \t]+[A-Za-z_]+)?)[*`]*[ \t]*(?:[-–][ \t]*(.*?))?[ \t]*\r?$",
    )
    .unwrap()
});

/// Result of running the strategy chain, with the rejected candidates.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub result: PhaseResult,
    pub rejected: Vec<ExtractionError>,
}

/// Extract a result from raw output. Never fails; the worst case is `Unclear`.
pub fn extract(raw: &str, phase: PhaseType) -> PhaseResult {
    extract_with_report(raw, phase).result
}

/// Structured strategies only.
///
/// Returns the last rejection (or `NoStructuredResult`) when nothing usable
/// was found.
pub fn extract_structured(raw: &str, phase: PhaseType) -> Result<PhaseResult, ExtractionError> {
    let mut rejected = Vec::new();
    match structured(raw, phase, &mut rejected) {
        Some(result) => Ok(fill_numeric(result, raw)),
        None => Err(rejected.pop().unwrap_or(ExtractionError::NoStructuredResult)),
    }
}

pub fn extract_with_report(raw: &str, phase: PhaseType) -> Extraction {
    let mut rejected = Vec::new();

    let result = match structured(raw, phase, &mut rejected) {
        Some(result) => result,
        None => {
            let status = classify(raw, phase);
            tracing::debug!(
                phase = %phase,
                %status,
                vocabulary = VOCABULARY_VERSION,
                "no structured result, used fuzzy classification"
            );
            PhaseResult::new(phase, status, ExtractionSource::Fuzzy)
        }
    };

    let mut result = fill_numeric(result, raw);
    if result.status == PhaseStatus::Unclear && result.tests.is_some_and(|t| t.failed > 0) {
        result.status = PhaseStatus::Failed;
    }

    Extraction { result, rejected }
}

fn structured(
    raw: &str,
    phase: PhaseType,
    rejected: &mut Vec<ExtractionError>,
) -> Option<PhaseResult> {
    let blocks: Vec<(String, &str)> = FENCE_REGEX
        .captures_iter(raw)
        .filter_map(|cap| {
            let marker = cap.get(1)?.as_str().to_lowercase();
            Some((marker, cap.get(2)?.as_str()))
        })
        .collect();

    for (markers, source) in [
        (&PRIMARY_MARKERS[..], ExtractionSource::FencedBlock),
        (&RESULT_MARKERS[..], ExtractionSource::ResultBlock),
    ] {
        for (marker, body) in blocks.iter().rev() {
            if !markers.contains(&marker.as_str()) {
                continue;
            }
            match parse_payload(body, phase, marker, source) {
                Ok(result) => return Some(result),
                Err(e) => rejected.push(e),
            }
        }
    }

    inline(raw, phase, rejected)
}

enum Candidate<'a> {
    Object(&'a str),
    Signal { status: &'a str, detail: Option<&'a str> },
}

fn inline(raw: &str, phase: PhaseType, rejected: &mut Vec<ExtractionError>) -> Option<PhaseResult> {
    let mut candidates: Vec<(usize, Candidate<'_>)> = find_json_objects(raw)
        .into_iter()
        .filter(|(_, obj)| obj.to_lowercase().contains("\"status\""))
        .map(|(offset, obj)| (offset, Candidate::Object(obj)))
        .collect();

    let tokens = phase.signal_tokens();
    for cap in SIGNAL_LINE_REGEX.captures_iter(raw) {
        let (Some(whole), Some(token), Some(status)) = (cap.get(0), cap.get(1), cap.get(2)) else {
            continue;
        };
        if token.as_str() != "STATUS" && !tokens.contains(&token.as_str()) {
            continue;
        }
        candidates.push((
            whole.start(),
            Candidate::Signal {
                status: status.as_str(),
                detail: cap.get(3).map(|d| d.as_str()).filter(|d| !d.is_empty()),
            },
        ));
    }

    candidates.sort_by_key(|(offset, _)| *offset);

    for (_, candidate) in candidates.into_iter().rev() {
        let parsed = match candidate {
            Candidate::Object(obj) => parse_payload(obj, phase, "inline", ExtractionSource::InlineObject),
            Candidate::Signal { status, detail } => parse_signal(status, detail, phase),
        };
        match parsed {
            Ok(result) => return Some(result),
            Err(e) => rejected.push(e),
        }
    }

    None
}

fn parse_signal(
    status: &str,
    detail: Option<&str>,
    phase: PhaseType,
) -> Result<PhaseResult, ExtractionError> {
    // "Complete all" style captures fall back to the first word.
    let parsed = PhaseStatus::parse_word(status).or_else(|| {
        status
            .split_whitespace()
            .next()
            .and_then(PhaseStatus::parse_word)
    });
    let status = parsed.ok_or_else(|| ExtractionError::UnrecognizedStatus(status.to_string()))?;
    let mut result = PhaseResult::new(phase, status, ExtractionSource::SignalLine);
    if let Some(detail) = detail {
        result = result.with_summary(detail.trim());
    }
    Ok(result)
}

fn parse_payload(
    body: &str,
    phase: PhaseType,
    marker: &str,
    source: ExtractionSource,
) -> Result<PhaseResult, ExtractionError> {
    let malformed = |message: String| ExtractionError::MalformedBlock {
        marker: marker.to_string(),
        message,
    };

    let value: Value = serde_yaml::from_str(body).map_err(|e| malformed(e.to_string()))?;
    let map = value
        .as_mapping()
        .ok_or_else(|| malformed("not a key/value mapping".to_string()))?;

    let status_value = field(map, &["status", "result", "verdict"]).ok_or(ExtractionError::MissingStatus)?;
    let status_text = scalar_text(status_value).ok_or(ExtractionError::MissingStatus)?;
    let status = PhaseStatus::parse_word(&status_text)
        .ok_or(ExtractionError::UnrecognizedStatus(status_text))?;

    let mut result = PhaseResult::new(phase, status, source);

    if let Some(score) = field(map, &["score", "quality_score"]).and_then(number_value) {
        result = result.with_score(score.min(100) as u8);
    }

    if let Some(Value::Sequence(items)) = field(map, &["issues", "findings"]) {
        result = result.with_issues(items.iter().filter_map(parse_issue).collect());
    }

    if let Some(Value::Mapping(tests)) = field(map, &["tests", "test_results"]) {
        if let Some(passed) = field(tests, &["passed"]).and_then(number_value) {
            result = result.with_tests(TestCounts {
                passed,
                failed: field(tests, &["failed"]).and_then(number_value).unwrap_or(0),
                total: field(tests, &["total"]).and_then(number_value),
            });
        }
    }

    if let Some(Value::Mapping(cov)) = field(map, &["coverage"]) {
        let top = field(cov, &["p0", "top_tier"]).and_then(float_value);
        let next = field(cov, &["p1", "next_tier"]).and_then(float_value);
        if let (Some(top_tier), Some(next_tier)) = (top, next) {
            result = result.with_coverage(Coverage { top_tier, next_tier });
        }
    }

    if let Some(Value::Mapping(sc)) = field(map, &["scenarios"]) {
        result = result.with_scenarios(ScenarioCounts {
            passed: field(sc, &["passed"]).and_then(number_value).unwrap_or(0),
            failed: field(sc, &["failed"]).and_then(number_value).unwrap_or(0),
            manual: field(sc, &["manual"]).and_then(number_value).unwrap_or(0),
        });
    }

    if let Some(summary) = field(map, &["summary", "detail", "details", "message"]).and_then(Value::as_str) {
        result = result.with_summary(summary.trim());
    }

    Ok(result)
}

fn parse_issue(value: &Value) -> Option<Issue> {
    match value {
        Value::String(text) => Some(Issue::new("general", Severity::default(), text)),
        Value::Mapping(map) => {
            let description = field(map, &["description", "message", "title", "issue"])
                .and_then(Value::as_str)?;
            let severity = field(map, &["severity", "level", "priority"])
                .and_then(scalar_text)
                .and_then(|s| Severity::parse_word(&s))
                .unwrap_or_default();
            let category = field(map, &["category", "type", "kind"])
                .and_then(Value::as_str)
                .unwrap_or("general");

            let mut issue = Issue::new(category, severity, description);
            if let Some(location) = field(map, &["location", "file", "path"]).and_then(Value::as_str) {
                issue = match field(map, &["line"]).and_then(number_value) {
                    Some(line) => issue.with_location(&format!("{}:{}", location, line)),
                    None => issue.with_location(location),
                };
            }
            if field(map, &["fixable"]).and_then(Value::as_bool) == Some(false) {
                issue = issue.not_fixable();
            }
            Some(issue)
        }
        _ => None,
    }
}

fn field<'a>(map: &'a Mapping, names: &[&str]) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| {
            k.as_str()
                .is_some_and(|k| names.iter().any(|n| k.eq_ignore_ascii_case(n)))
        })
        .map(|(_, v)| v)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "passed" } else { "failed" }.to_string()),
        _ => None,
    }
}

fn number_value(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .map(|n| n.min(u32::MAX as u64) as u32),
        // "85/100" or "85%"
        Value::String(s) => {
            let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

fn float_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

/// Fill numeric fields the structured result left empty from the raw text.
fn fill_numeric(mut result: PhaseResult, raw: &str) -> PhaseResult {
    if result.tests.is_none() {
        result.tests = scrape_test_counts(raw);
    }
    if result.score.is_none() {
        result.score = scrape_score(raw);
    }
    if result.coverage.is_none() {
        result.coverage = scrape_coverage(raw);
    }
    if result.scenarios.is_none() {
        result.scenarios = scrape_scenarios(raw);
    }
    result
}
