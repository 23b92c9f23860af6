//! Stories: the unit of work an epic sequences.
//!
//! A story is a markdown file named `<epic>.<story>-<slug>.md`. Its mutable
//! progress lives in a separate [`StoryRecord`] persisted under
//! `.epicflow/state/stories/`.

use crate::errors::ConfigurationError;
use crate::fixloop::FixAttempt;
use crate::gates::GateVerdict;
use crate::orchestrator::state::write_atomic;
use crate::phase::{Issue, PhaseResult, PhaseType};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

static STORY_FILE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)(?:[-.](.+))?\.md$").unwrap());

static DEPENDS_ON_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^[ \t>*_-]*depends[ _-]on[*_]*[ \t]*:[*_]*[ \t]*(.+)$").unwrap()
});

static STORY_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)").unwrap());

static TITLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#[ \t]+(.+?)[ \t]*$").unwrap());

/// `<epic>.<story>`, e.g. `3.2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoryId {
    pub epic: u32,
    pub number: u32,
}

impl StoryId {
    pub fn new(epic: u32, number: u32) -> Self {
        Self { epic, number }
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epic, self.number)
    }
}

impl FromStr for StoryId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (epic, number) = s
            .trim()
            .split_once('.')
            .with_context(|| format!("Invalid story id '{}': expected <epic>.<story>", s))?;
        Ok(Self {
            epic: epic
                .parse()
                .with_context(|| format!("Invalid epic number in story id '{}'", s))?,
            number: number
                .parse()
                .with_context(|| format!("Invalid story number in story id '{}'", s))?,
        })
    }
}

impl TryFrom<String> for StoryId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StoryId> for String {
    fn from(id: StoryId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Story {
    pub id: StoryId,
    pub title: String,
    pub path: PathBuf,
    pub content: String,
    pub depends_on: Vec<StoryId>,
}

impl Story {
    /// Parse a story from its file name and content.
    pub fn parse(path: &Path, content: String) -> Option<Story> {
        let file_name = path.file_name()?.to_str()?;
        let caps = STORY_FILE_REGEX.captures(file_name)?;
        let id = StoryId::new(caps[1].parse().ok()?, caps[2].parse().ok()?);

        let title = TITLE_REGEX
            .captures(&content)
            .map(|c| c[1].to_string())
            .or_else(|| caps.get(3).map(|slug| slug.as_str().replace(['-', '_'], " ")))
            .unwrap_or_else(|| format!("Story {}", id));

        let depends_on = parse_dependencies(&content)
            .into_iter()
            .filter(|dep| *dep != id)
            .collect();

        Some(Story {
            id,
            title,
            path: path.to_path_buf(),
            content,
            depends_on,
        })
    }

    /// Log and file-name scope, e.g. `story-3.2`.
    pub fn scope(&self) -> String {
        format!("story-{}", self.id)
    }
}

/// Story ids listed on `Depends-On:` lines, in order, without duplicates.
pub fn parse_dependencies(content: &str) -> Vec<StoryId> {
    let mut deps = Vec::new();
    for line in DEPENDS_ON_REGEX.captures_iter(content) {
        for cap in STORY_ID_REGEX.captures_iter(&line[1]) {
            let (Ok(epic), Ok(number)) = (cap[1].parse(), cap[2].parse()) else {
                continue;
            };
            let id = StoryId::new(epic, number);
            if !deps.contains(&id) {
                deps.push(id);
            }
        }
    }
    deps
}

/// Load every story of `epic` from `dir`, ordered by story number.
pub fn load_stories(dir: &Path, epic: u32) -> Result<Vec<Story>, ConfigurationError> {
    if !dir.is_dir() {
        return Err(ConfigurationError::MissingStoriesDir(dir.to_path_buf()));
    }

    let pattern = dir.join(format!("{}.*.md", epic)).to_string_lossy().to_string();
    let paths = glob::glob(&pattern)
        .map_err(|e| ConfigurationError::InvalidConfig(format!("bad stories pattern: {}", e)))?;

    let mut stories = Vec::new();
    for path in paths.filter_map(|entry| entry.ok()) {
        let content = std::fs::read_to_string(&path).map_err(|source| {
            ConfigurationError::UnreadableStory {
                path: path.clone(),
                source,
            }
        })?;
        if let Some(story) = Story::parse(&path, content)
            && story.id.epic == epic
        {
            stories.push(story);
        }
    }

    if stories.is_empty() {
        return Err(ConfigurationError::NoStories {
            epic,
            dir: dir.to_path_buf(),
        });
    }

    stories.sort_by_key(|s| s.id);
    stories.dedup_by_key(|s| s.id);
    Ok(stories)
}

/// Story counts per epic found in `dir`.
pub fn discover_epics(dir: &Path) -> Result<Vec<(u32, usize)>, ConfigurationError> {
    if !dir.is_dir() {
        return Err(ConfigurationError::MissingStoriesDir(dir.to_path_buf()));
    }
    let pattern = dir.join("*.md").to_string_lossy().to_string();
    let paths = glob::glob(&pattern)
        .map_err(|e| ConfigurationError::InvalidConfig(format!("bad stories pattern: {}", e)))?;

    let mut counts: std::collections::BTreeMap<u32, usize> = Default::default();
    for path in paths.filter_map(|entry| entry.ok()) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(caps) = STORY_FILE_REGEX.captures(name)
            && let Ok(epic) = caps[1].parse::<u32>()
        {
            *counts.entry(epic).or_default() += 1;
        }
    }
    Ok(counts.into_iter().collect())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Blocked,
    Skipped,
}

impl StoryStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, StoryStatus::Done | StoryStatus::Blocked | StoryStatus::Skipped)
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in progress",
            StoryStatus::Done => "done",
            StoryStatus::Blocked => "blocked",
            StoryStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// One finished phase in a story's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: PhaseType,
    /// Result of the initial invocation.
    pub initial: PhaseResult,
    #[serde(default)]
    pub attempts: Vec<FixAttempt>,
    /// The result the verdict was computed from.
    pub result: PhaseResult,
    pub verdict: GateVerdict,
    /// Issues accepted without a fix.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documented: Vec<Issue>,
    #[serde(default)]
    pub escalated: bool,
    pub finished_at: DateTime<Utc>,
}

/// A story's persisted progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRecord {
    pub story_id: StoryId,
    pub status: StoryStatus,
    #[serde(default)]
    pub history: Vec<PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StoryRecord {
    pub fn new(story_id: StoryId) -> Self {
        Self {
            story_id,
            status: StoryStatus::Pending,
            history: Vec::new(),
            reason: None,
            updated_at: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read story record {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse story record {}", path.display()))?;
        Ok(Some(record))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self).context("Failed to write story record")
    }

    /// Start a fresh attempt at the story. Earlier history is discarded.
    pub fn begin(&mut self) {
        self.status = StoryStatus::InProgress;
        self.history.clear();
        self.reason = None;
        self.updated_at = Utc::now();
    }

    pub fn push_phase(&mut self, record: PhaseRecord) {
        self.history.push(record);
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, status: StoryStatus, reason: Option<String>) {
        debug_assert!(status.is_final());
        self.status = status;
        self.reason = reason;
        self.updated_at = Utc::now();
    }

    /// Verdict of the last phase in the history.
    pub fn last_verdict(&self) -> Option<GateVerdict> {
        self.history.last().map(|r| r.verdict)
    }

    pub fn total_fix_attempts(&self) -> usize {
        self.history.iter().map(|r| r.attempts.len()).sum()
    }
}
