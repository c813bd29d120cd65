//! snapkeep: incremental, verified, optionally encrypted directory snapshots.
//!
//! Each backup of a target directory becomes one container file holding the
//! files that changed since the previous snapshot, either whole or as a binary
//! delta. Containers are decoded and fully reconstructed before they are
//! registered, and restores re-verify every file before writing it.

pub mod backup;
pub mod catalog;
pub mod chain;
pub mod codec;
pub mod config;
pub mod control;
pub mod crypto;
pub mod delta;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod repository;
pub mod restore;
mod rolling_hash;
pub mod scheduler;
pub mod snapshot;
mod util;
pub mod vault;

pub use backup::{BackupOptions, BackupReport};
pub use config::VaultConfig;
pub use control::CancelToken;
pub use crypto::Passphrase;
pub use error::{Error, Result, RunKind};
pub use hasher::Fingerprint;
pub use restore::{RestoreOptions, RestoreReport};
pub use scheduler::{ScheduledBackup, Scheduler};
pub use snapshot::{SnapshotId, SnapshotKind, SnapshotSummary, StorageMode};
pub use vault::Vault;
