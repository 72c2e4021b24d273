//! Per-project file lock
//!
//! Mutating operations hold an exclusive `flock` on
//! `<data_root>/compose/<project>.lock` so two invocations never converge the
//! same project at once. The lock is released when the guard is dropped.

use crate::error::{CtlError, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Held project lock
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    /// Wait for the lock of `project`
    pub async fn acquire(dir: &Path, project: &str) -> Result<Self> {
        let path = lock_path(dir, project);
        tokio::task::spawn_blocking(move || Self::lock(path, libc::LOCK_EX))
            .await
            .map_err(|e| CtlError::Lock(format!("lock task failed: {}", e)))?
    }

    /// Take the lock of `project` if nobody holds it
    pub fn try_acquire(dir: &Path, project: &str) -> Result<Self> {
        Self::lock(lock_path(dir, project), libc::LOCK_EX | libc::LOCK_NB)
    }

    fn lock(path: PathBuf, operation: i32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        flock(&file, operation).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                CtlError::Lock(format!(
                    "project is locked by another invocation ({})",
                    path.display()
                ))
            } else {
                CtlError::Lock(format!("{}: {}", path.display(), e))
            }
        })?;

        tracing::debug!("Locked {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = flock(&self.file, libc::LOCK_UN);
    }
}

fn lock_path(dir: &Path, project: &str) -> PathBuf {
    dir.join(format!("{}.lock", project))
}

fn flock(file: &File, operation: i32) -> io::Result<()> {
    let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let temp = tempdir().unwrap();

        let held = ProjectLock::acquire(temp.path(), "proj").await.unwrap();
        assert!(held.path().ends_with("proj.lock"));

        let err = ProjectLock::try_acquire(temp.path(), "proj").unwrap_err();
        assert!(matches!(err, CtlError::Lock(_)));
        // Other projects are independent
        ProjectLock::try_acquire(temp.path(), "other").unwrap();

        drop(held);
        ProjectLock::try_acquire(temp.path(), "proj").unwrap();
    }
}
