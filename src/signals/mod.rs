//! Result extraction from agent output.
//!
//! The agent answers in free text. This module turns that text into a typed
//! [`PhaseResult`](crate::phase::PhaseResult) with a two-tier parser:
//!
//! - Structured: the last fenced block (```` ```yaml ````, ```` ```json ````,
//!   ```` ```signal ````), then the last ```` ```result ```` block, then the
//!   last inline JSON object or `TOKEN: STATUS - detail` signal line
//! - Fuzzy: versioned per-phase vocabularies, yielding `Unclear` when nothing
//!   matches with confidence
//!
//! Numeric side channels (test counts, scores, coverage, scenarios) are
//! scraped from the text whenever the structured result does not carry them.

mod counts;
mod parser;
pub mod vocabulary;

pub use counts::{scrape_coverage, scrape_scenarios, scrape_score, scrape_test_counts};
pub use parser::{Extraction, extract, extract_structured, extract_with_report};
pub use vocabulary::{VOCABULARY_VERSION, Vocabulary, classify, vocabulary_for};
