//! Error types for snapkeep

use std::path::PathBuf;

use thiserror::Error;

use crate::hasher::Fingerprint;
use crate::snapshot::SnapshotId;

/// Errors produced by the backup and restore engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt delta: {reason}")]
    CorruptDelta { reason: String },

    #[error("container encode failed: {reason}")]
    Encode { reason: String },

    #[error("container decode failed: {reason}")]
    Decode { reason: String },

    #[error("container authentication failed (tampered data or wrong passphrase)")]
    Authentication,

    #[error("container format version {found} is newer than supported version {supported}")]
    VersionMismatch { found: u16, supported: u16 },

    #[error("container is encrypted but no passphrase was supplied")]
    MissingKey,

    #[error("container checksum mismatch for snapshot {id}: expected {expected}, found {actual}")]
    ContainerChecksum {
        id: SnapshotId,
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("broken snapshot chain: snapshot {missing} is missing")]
    BrokenChain { missing: SnapshotId },

    #[error("integrity check failed for {path} in snapshot {snapshot}: expected {expected}, found {actual}")]
    Integrity {
        snapshot: SnapshotId,
        path: String,
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("a {run} run is already active for {}", target.display())]
    Busy { target: PathBuf, run: RunKind },

    #[error("operation cancelled")]
    Cancelled,

    #[error("snapshot {id} not found")]
    NotFound { id: SnapshotId },

    #[error("no snapshots recorded for {}", target.display())]
    NoSnapshots { target: PathBuf },

    #[error("snapshot {id} is still the parent of snapshot {dependent}")]
    RetentionConflict {
        id: SnapshotId,
        dependent: SnapshotId,
    },

    #[error("catalog invariant violated: {reason}")]
    CatalogInvariant { reason: String },

    #[error("scheduler is already running")]
    SchedulerRunning,

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Kind of run tracked by the busy registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunKind {
    Backup,
    Restore,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunKind::Backup => f.write_str("backup"),
            RunKind::Restore => f.write_str("restore"),
        }
    }
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        Error::Decode {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt_delta(reason: impl Into<String>) -> Self {
        Error::CorruptDelta {
            reason: reason.into(),
        }
    }

    /// True for failures that mean the stored data cannot be trusted, as opposed
    /// to environmental failures such as I/O or a busy target.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Error::CorruptDelta { .. }
                | Error::Decode { .. }
                | Error::Authentication
                | Error::ContainerChecksum { .. }
                | Error::BrokenChain { .. }
                | Error::Integrity { .. }
        )
    }
}

/// Result type alias for snapkeep operations
pub type Result<T> = std::result::Result<T, Error>;

/// Attach a path to raw `std::io` results.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
