//! The working tree shared between phases.
//!
//! A phase hands off to the next by staging its changes. Completed stories
//! are committed.

pub mod git;

pub use git::GitWorkspace;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait Workspace: Send + Sync {
    /// Stage every change in the working tree. Returns the changed paths.
    fn stage_all(&self) -> Result<Vec<PathBuf>>;

    /// Commit the staged tree. `None` when there was nothing to commit.
    fn commit(&self, message: &str) -> Result<Option<String>>;

    /// Paths that differ from the last commit.
    fn changed_files(&self) -> Result<Vec<PathBuf>>;

    fn kind(&self) -> &'static str;
}

/// For projects without a repository. Records calls so tests can assert on them.
#[derive(Default)]
pub struct NoopWorkspace {
    stages: Mutex<usize>,
    commits: Mutex<Vec<String>>,
}

impl NoopWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn commit_messages(&self) -> Vec<String> {
        self.commits.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Workspace for NoopWorkspace {
    fn stage_all(&self) -> Result<Vec<PathBuf>> {
        if let Ok(mut n) = self.stages.lock() {
            *n += 1;
        }
        Ok(Vec::new())
    }

    fn commit(&self, message: &str) -> Result<Option<String>> {
        if let Ok(mut commits) = self.commits.lock() {
            commits.push(message.to_string());
        }
        Ok(None)
    }

    fn changed_files(&self) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn kind(&self) -> &'static str {
        "none"
    }
}

/// Open the project's git repository, or fall back to a no-op workspace.
pub fn open_workspace(project_dir: &Path, use_git: bool) -> Box<dyn Workspace> {
    if !use_git {
        return Box::new(NoopWorkspace::new());
    }
    match GitWorkspace::open(project_dir) {
        Ok(ws) => Box::new(ws),
        Err(e) => {
            tracing::warn!(
                error = %e,
                dir = %project_dir.display(),
                "no git repository, phase hand-off will not be staged"
            );
            Box::new(NoopWorkspace::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_noop_workspace_records_calls() {
        let ws = NoopWorkspace::new();
        ws.stage_all().unwrap();
        ws.stage_all().unwrap();
        assert_eq!(ws.commit("story 1.1: done").unwrap(), None);
        assert_eq!(ws.stage_count(), 2);
        assert_eq!(ws.commit_messages(), vec!["story 1.1: done"]);
    }

    #[test]
    fn test_open_workspace_falls_back_without_repo() {
        let dir = tempdir().unwrap();
        assert_eq!(open_workspace(dir.path(), true).kind(), "none");
        git2::Repository::init(dir.path()).unwrap();
        assert_eq!(open_workspace(dir.path(), true).kind(), "git");
        assert_eq!(open_workspace(dir.path(), false).kind(), "none");
    }
}
