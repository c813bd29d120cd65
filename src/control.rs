//! Run control: rejecting overlapping runs on one target, and cooperative
//! cancellation between file-level steps.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, IoContext, Result, RunKind};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Exclusive claim on one kind of run for one target.
///
/// Backed by an OS file lock on `<repository>/<kind>.lock`, so it excludes
/// every other handle to the store: other `Vault`s in this process and other
/// processes alike. Dropping the guard closes the file and releases the lock.
#[derive(Debug)]
pub struct RunGuard {
    _file: File,
    path: PathBuf,
}

impl RunGuard {
    /// Claim `lock_path` for a run of `kind` on `target`, or fail with `Busy`.
    pub fn try_acquire(lock_path: &Path, target: &Path, kind: RunKind) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .at(lock_path)?;
        match file.try_lock() {
            Ok(()) => Ok(Self {
                _file: file,
                path: lock_path.to_path_buf(),
            }),
            Err(TryLockError::WouldBlock) => Err(Error::Busy {
                target: target.to_path_buf(),
                run: kind,
            }),
            Err(TryLockError::Error(e)) => Err(Error::io(lock_path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_busy_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = Path::new("/data/home");
        let backup_lock = dir.path().join("backup.lock");
        let guard = RunGuard::try_acquire(&backup_lock, target, RunKind::Backup).unwrap();
        assert_eq!(guard.path(), backup_lock);
        assert!(matches!(
            RunGuard::try_acquire(&backup_lock, target, RunKind::Backup),
            Err(Error::Busy { run: RunKind::Backup, .. })
        ));
        // Restores hold their own lock file.
        let _restore =
            RunGuard::try_acquire(&dir.path().join("restore.lock"), target, RunKind::Restore)
                .unwrap();

        drop(guard);
        assert!(RunGuard::try_acquire(&backup_lock, target, RunKind::Backup).is_ok());
    }

    #[test]
    fn test_missing_lock_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("gone").join("backup.lock");
        assert!(matches!(
            RunGuard::try_acquire(&lock, Path::new("/data"), RunKind::Backup),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
