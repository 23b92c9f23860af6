use crate::errors::ConfigurationError;
use crate::gates::GateVerdict;
use crate::phase::PhaseType;
use crate::story::StoryStatus;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    StoryFinished,
    Interrupted,
    Aborted,
    EpicComplete,
}

impl std::fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointReason::StoryFinished => "story finished",
            CheckpointReason::Interrupted => "interrupted",
            CheckpointReason::Aborted => "aborted",
            CheckpointReason::EpicComplete => "epic complete",
        };
        write!(f, "{}", s)
    }
}

/// Persisted run progress for one epic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epic_id: u32,
    /// 0-based index of the last story that reached a final status.
    pub last_completed_index: Option<usize>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timestamp: DateTime<Utc>,
    pub reason: CheckpointReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Checkpoint {
    /// Index of the first story a resumed run executes.
    pub fn next_index(&self) -> usize {
        self.last_completed_index.map_or(0, |i| i + 1)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }
}

const MAX_AGE_CAP_HOURS: u64 = 24 * 365 * 10;

/// Whole-file checkpoint persistence for one epic.
pub struct CheckpointStore {
    path: PathBuf,
    max_age: Duration,
}

impl CheckpointStore {
    pub fn new(path: PathBuf, max_age_hours: u64) -> Self {
        let hours = i64::try_from(max_age_hours.min(MAX_AGE_CAP_HOURS)).unwrap_or(24);
        Self {
            path,
            max_age: Duration::hours(hours),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the checkpoint file atomically (temp file, then rename).
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_atomic(&self.path, checkpoint).context("Failed to write checkpoint")
    }

    /// Read the checkpoint. `Ok(None)` when there is none.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read checkpoint {}", self.path.display()))?;
        let checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint {}", self.path.display()))?;
        Ok(Some(checkpoint))
    }

    /// The checkpoint if it belongs to `epic` and is younger than the
    /// freshness horizon. Anything else is ignored with a log line.
    pub fn load_fresh(&self, epic: u32, now: DateTime<Utc>) -> Option<Checkpoint> {
        let checkpoint = match self.load() {
            Ok(Some(cp)) => cp,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable checkpoint");
                return None;
            }
        };

        if checkpoint.epic_id != epic {
            tracing::warn!(
                expected = epic,
                found = checkpoint.epic_id,
                "ignoring checkpoint written for another epic"
            );
            return None;
        }

        let age = checkpoint.age(now);
        if age > self.max_age {
            tracing::info!(
                epic,
                age_hours = age.num_hours(),
                "ignoring stale checkpoint"
            );
            return None;
        }

        Some(checkpoint)
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).context("Failed to remove checkpoint")?;
        }
        Ok(())
    }
}

/// Serialize `value` as pretty JSON and swap it into place.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("Failed to serialize state")?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all().ok();
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// Where an epic run begins, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// `--start-from N`
    Explicit(usize),
    /// `--no-resume`
    Restart,
    /// A fresh checkpoint.
    Checkpoint(usize),
    /// Nothing to resume.
    Beginning,
}

impl ResumePoint {
    pub fn index(&self) -> usize {
        match self {
            ResumePoint::Explicit(i) | ResumePoint::Checkpoint(i) => *i,
            ResumePoint::Restart | ResumePoint::Beginning => 0,
        }
    }
}

/// Compute the effective start index.
///
/// `start_from` is the 1-based story number and always wins. `no_resume`
/// ignores any checkpoint. A checkpoint for a finished epic starts over.
pub fn resume_point(
    epic: u32,
    story_count: usize,
    start_from: Option<usize>,
    no_resume: bool,
    checkpoint: Option<&Checkpoint>,
) -> Result<ResumePoint, ConfigurationError> {
    if let Some(n) = start_from {
        if n == 0 || n > story_count {
            return Err(ConfigurationError::InvalidStartFrom {
                epic,
                requested: n,
                available: story_count,
            });
        }
        return Ok(ResumePoint::Explicit(n - 1));
    }
    if no_resume {
        return Ok(ResumePoint::Restart);
    }
    match checkpoint {
        Some(cp) if cp.reason != CheckpointReason::EpicComplete => {
            Ok(ResumePoint::Checkpoint(cp.next_index().min(story_count)))
        }
        _ => Ok(ResumePoint::Beginning),
    }
}

/// The last failing gate seen in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<String>,
    pub phase: PhaseType,
    pub verdict: GateVerdict,
}

/// Mutable progress threaded through the epic loop. Its persisted subset is
/// the checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub epic_id: u32,
    pub run_id: String,
    pub next_index: usize,
    pub last_completed_index: Option<usize>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub last_verdict: Option<GateVerdict>,
    pub last_failure: Option<FailurePoint>,
}

impl RunState {
    pub fn new(epic_id: u32, run_id: &str, start_index: usize) -> Self {
        Self {
            epic_id,
            run_id: run_id.to_string(),
            next_index: start_index,
            last_completed_index: start_index.checked_sub(1),
            completed: 0,
            failed: 0,
            skipped: 0,
            last_verdict: None,
            last_failure: None,
        }
    }

    /// Continue the counts of a resumed checkpoint.
    pub fn resume(epic_id: u32, run_id: &str, checkpoint: &Checkpoint) -> Self {
        let mut state = Self::new(epic_id, run_id, checkpoint.next_index());
        state.completed = checkpoint.completed;
        state.failed = checkpoint.failed;
        state.skipped = checkpoint.skipped;
        state
    }

    /// Record a story that reached a final status.
    pub fn record_story(&mut self, index: usize, status: StoryStatus, verdict: Option<GateVerdict>) {
        match status {
            StoryStatus::Done => self.completed += 1,
            StoryStatus::Blocked => self.failed += 1,
            StoryStatus::Skipped => self.skipped += 1,
            StoryStatus::Pending | StoryStatus::InProgress => {
                debug_assert!(false, "record_story called with non-final status {:?}", status);
                return;
            }
        }
        self.last_completed_index = Some(index);
        self.next_index = index + 1;
        if verdict.is_some() {
            self.last_verdict = verdict;
        }
    }

    pub fn record_failure(&mut self, story: Option<&str>, phase: PhaseType, verdict: GateVerdict) {
        self.last_verdict = Some(verdict);
        self.last_failure = Some(FailurePoint {
            story: story.map(str::to_string),
            phase,
            verdict,
        });
    }

    pub fn to_checkpoint(&self, reason: CheckpointReason, now: DateTime<Utc>) -> Checkpoint {
        Checkpoint {
            epic_id: self.epic_id,
            last_completed_index: self.last_completed_index,
            completed: self.completed,
            failed: self.failed,
            skipped: self.skipped,
            timestamp: now,
            reason,
            run_id: Some(self.run_id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (CheckpointStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/epic-3.checkpoint.json");
        (CheckpointStore::new(path, 24), dir)
    }

    fn checkpoint_after(index: usize, at: DateTime<Utc>) -> Checkpoint {
        let mut state = RunState::new(3, "run", 0);
        for i in 0..=index {
            state.record_story(i, StoryStatus::Done, Some(GateVerdict::Pass));
        }
        state.to_checkpoint(CheckpointReason::StoryFinished, at)
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let (store, _dir) = make_store();
        assert!(store.load().unwrap().is_none());
        assert!(store.load_fresh(3, Utc::now()).is_none());
    }

    #[test]
    fn test_checkpoint_roundtrip_resumes_at_next_story() {
        let (store, _dir) = make_store();
        let now = Utc::now();
        store.save(&checkpoint_after(2, now)).unwrap();

        let loaded = store.load_fresh(3, now).unwrap();
        assert_eq!(loaded.last_completed_index, Some(2));
        assert_eq!(loaded.completed, 3);
        let point = resume_point(3, 5, None, false, Some(&loaded)).unwrap();
        assert_eq!(point, ResumePoint::Checkpoint(3));
    }

    #[test]
    fn test_save_replaces_whole_file() {
        let (store, _dir) = make_store();
        let now = Utc::now();
        store.save(&checkpoint_after(4, now)).unwrap();
        store.save(&checkpoint_after(0, now)).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.last_completed_index, Some(0));
        let tmp = store.path().with_extension("json.tmp");
        assert!(!tmp.exists());
    }

    #[test]
    fn test_stale_checkpoint_ignored() {
        let (store, _dir) = make_store();
        let written = Utc::now() - Duration::hours(30);
        store.save(&checkpoint_after(1, written)).unwrap();
        assert!(store.load_fresh(3, Utc::now()).is_none());
    }

    #[test]
    fn test_other_epic_checkpoint_ignored() {
        let (store, _dir) = make_store();
        store.save(&checkpoint_after(1, Utc::now())).unwrap();
        assert!(store.load_fresh(4, Utc::now()).is_none());
    }

    #[test]
    fn test_corrupt_checkpoint_ignored() {
        let (store, _dir) = make_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().is_err());
        assert!(store.load_fresh(3, Utc::now()).is_none());
    }

    #[test]
    fn test_explicit_start_overrides_checkpoint() {
        let cp = checkpoint_after(2, Utc::now());
        assert_eq!(
            resume_point(3, 5, Some(1), false, Some(&cp)).unwrap(),
            ResumePoint::Explicit(0)
        );
        assert_eq!(
            resume_point(3, 5, None, true, Some(&cp)).unwrap(),
            ResumePoint::Restart
        );
    }

    #[test]
    fn test_start_from_out_of_range() {
        let err = resume_point(3, 5, Some(6), false, None).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidStartFrom { requested: 6, available: 5, .. }
        ));
        assert!(resume_point(3, 5, Some(0), false, None).is_err());
    }

    #[test]
    fn test_finished_epic_starts_over() {
        let mut cp = checkpoint_after(4, Utc::now());
        cp.reason = CheckpointReason::EpicComplete;
        assert_eq!(
            resume_point(3, 5, None, false, Some(&cp)).unwrap(),
            ResumePoint::Beginning
        );
    }

    #[test]
    fn test_run_state_counts() {
        let mut state = RunState::new(3, "run", 0);
        state.record_story(0, StoryStatus::Done, Some(GateVerdict::Pass));
        state.record_story(1, StoryStatus::Blocked, Some(GateVerdict::Fail));
        state.record_story(2, StoryStatus::Skipped, None);
        assert_eq!((state.completed, state.failed, state.skipped), (1, 1, 1));
        assert_eq!(state.next_index, 3);
        assert_eq!(state.last_verdict, Some(GateVerdict::Fail));
    }

    #[test]
    fn test_resume_continues_counts() {
        let cp = checkpoint_after(1, Utc::now());
        let state = RunState::resume(3, "run-2", &cp);
        assert_eq!(state.next_index, 2);
        assert_eq!(state.completed, 2);
        assert_eq!(state.last_completed_index, Some(1));
    }
}
