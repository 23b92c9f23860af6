use crate::errors::ConfigurationError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Exclusive per-epic run lock, released on drop.
#[derive(Debug)]
pub struct EpicLock {
    file: File,
    path: PathBuf,
}

impl EpicLock {
    /// Take the lock or fail with `EpicLocked` if another run holds it.
    pub fn acquire(path: &Path, epic: u32, run_id: &str) -> Result<Self, ConfigurationError> {
        let locked = || ConfigurationError::EpicLocked {
            epic,
            lock: path.to_path_buf(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigurationError::InvalidConfig(format!(
                    "cannot create lock directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| {
                ConfigurationError::InvalidConfig(format!("cannot open lock {}: {}", path.display(), e))
            })?;

        FileExt::try_lock_exclusive(&file).map_err(|_| locked())?;

        // Holder details are informational only.
        let _ = file.set_len(0);
        let _ = writeln!(file, "pid={}\nrun_id={}", std::process::id(), run_id);

        tracing::debug!(epic, lock = %path.display(), "epic lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EpicLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to release epic lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/epic-3.lock");
        let first = EpicLock::acquire(&path, 3, "a").unwrap();
        let err = EpicLock::acquire(&path, 3, "b").unwrap_err();
        assert!(matches!(err, ConfigurationError::EpicLocked { epic: 3, .. }));
        drop(first);
        assert!(EpicLock::acquire(&path, 3, "c").is_ok());
    }

    #[test]
    fn test_lock_records_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("epic-1.lock");
        let lock = EpicLock::acquire(&path, 1, "run-xyz").unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert!(content.contains("run_id=run-xyz"));
    }
}
