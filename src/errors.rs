//! Typed error hierarchy for the epicflow orchestrator.
//!
//! - `ConfigurationError`: missing or invalid inputs, fatal before any agent call
//! - `InvocationError`: agent invocation failures, absorbed by the runner
//! - `ExtractionError`: a strategy could not recover a structured result
//! - `GateFailure`: a terminal gate verdict for a story or chain
//!
//! Everything else (io, persistence, git) travels as `anyhow::Error`.

use crate::gates::GateVerdict;
use crate::phase::PhaseType;
use std::path::PathBuf;
use thiserror::Error;

/// Missing or invalid external inputs. Aborts the run before any agent invocation.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Stories directory not found: {0}")]
    MissingStoriesDir(PathBuf),

    #[error("No stories found for epic {epic} in {dir}")]
    NoStories { epic: u32, dir: PathBuf },

    #[error("Failed to read story file {path}: {source}")]
    UnreadableStory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown epic {epic} (stories exist for epics: {known})")]
    UnknownEpic { epic: u32, known: String },

    #[error("--start-from {requested} is out of range (epic {epic} has {available} stories)")]
    InvalidStartFrom {
        epic: u32,
        requested: usize,
        available: usize,
    },

    #[error("Epic {epic} is already being run by another process (lock: {lock})")]
    EpicLocked { epic: u32, lock: PathBuf },
}

/// Failures invoking the external agent.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvocationError {
    #[error("Transient agent failure: {0}")]
    Transient(String),

    #[error("Agent timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl InvocationError {
    /// Only transient failures go through the backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InvocationError::Transient(_))
    }
}

/// Why a single extraction strategy produced nothing usable.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionError {
    #[error("Malformed {marker} block: {message}")]
    MalformedBlock { marker: String, message: String },

    #[error("Structured result has no status field")]
    MissingStatus,

    #[error("Unrecognized status '{0}'")]
    UnrecognizedStatus(String),

    #[error("No structured result found")]
    NoStructuredResult,
}

/// A gate verdict that ends a story or the chain.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Gate {phase} failed for {scope} with verdict {verdict}")]
pub struct GateFailure {
    /// `epic 3` or `story 3.2`
    pub scope: String,
    pub phase: PhaseType,
    pub verdict: GateVerdict,
}

/// Whether `err` or anything in its source chain is a [`ConfigurationError`].
pub fn is_configuration_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ConfigurationError>().is_some())
}
