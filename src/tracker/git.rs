use super::Workspace;
use crate::config::EPICFLOW_DIR;
use anyhow::{Context, Result};
use git2::{IndexAddOption, Repository, Signature, Status, StatusOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Working tree backed by a git repository.
pub struct GitWorkspace {
    repo: Mutex<Repository>,
}

impl GitWorkspace {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            repo: Mutex::new(repo),
        })
    }

    fn with_repo<T>(&self, f: impl FnOnce(&Repository) -> Result<T>) -> Result<T> {
        let repo = self
            .repo
            .lock()
            .map_err(|_| anyhow::anyhow!("git repository lock poisoned"))?;
        f(&repo)
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
        repo.head().ok().and_then(|head| head.peel_to_commit().ok())
    }

    fn is_internal(path: &Path) -> bool {
        path.starts_with(EPICFLOW_DIR)
    }

    /// Current HEAD SHA (None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.with_repo(|repo| Ok(Self::head_commit(repo).map(|c| c.id().to_string())))
            .ok()
            .flatten()
    }
}

impl Workspace for GitWorkspace {
    fn stage_all(&self) -> Result<Vec<PathBuf>> {
        self.with_repo(|repo| {
            let mut index = repo.index().context("Failed to read git index")?;

            // Orchestrator state never enters the hand-off.
            let mut skip_internal = |path: &Path, _spec: &[u8]| -> i32 {
                if Self::is_internal(path) { 1 } else { 0 }
            };
            index
                .add_all(
                    ["*"].iter(),
                    IndexAddOption::DEFAULT,
                    Some(&mut skip_internal as &mut git2::IndexMatchedPath),
                )
                .context("Failed to stage working tree")?;
            // Deletions are not picked up by add_all.
            index
                .update_all(
                    ["*"].iter(),
                    Some(&mut skip_internal as &mut git2::IndexMatchedPath),
                )
                .context("Failed to stage deletions")?;
            index.write().context("Failed to write git index")?;
            Ok(())
        })?;

        self.changed_files()
    }

    fn commit(&self, message: &str) -> Result<Option<String>> {
        self.with_repo(|repo| {
            let mut index = repo.index()?;
            let tree_id = index.write_tree()?;
            let parent = Self::head_commit(repo);

            if let Some(ref parent) = parent
                && parent.tree_id() == tree_id
            {
                return Ok(None);
            }

            let tree = repo.find_tree(tree_id)?;
            let sig = repo
                .signature()
                .or_else(|_| Signature::now("epicflow", "epicflow@localhost"))?;

            // Handle unborn branch (new repo with no commits yet)
            let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
            let commit_id = repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
                .context("Failed to create commit")?;

            Ok(Some(commit_id.to_string()))
        })
    }

    fn changed_files(&self) -> Result<Vec<PathBuf>> {
        self.with_repo(|repo| {
            let mut opts = StatusOptions::new();
            opts.include_untracked(true)
                .recurse_untracked_dirs(true)
                .include_ignored(false);

            let statuses = repo
                .statuses(Some(&mut opts))
                .context("Failed to read git status")?;

            let mut files: Vec<PathBuf> = statuses
                .iter()
                .filter(|entry| entry.status() != Status::CURRENT)
                .filter_map(|entry| entry.path().map(PathBuf::from))
                .filter(|path| !Self::is_internal(path))
                .collect();
            files.sort();
            files.dedup();
            Ok(files)
        })
    }

    fn kind(&self) -> &'static str {
        "git"
    }
}
