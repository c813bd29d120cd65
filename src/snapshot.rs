use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hasher::Fingerprint;

/// Snapshot identifier: strictly increasing per target, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    pub fn next(self) -> SnapshotId {
        SnapshotId(self.0 + 1)
    }

    /// File name of the container holding this snapshot.
    pub fn container_name(self) -> String {
        format!("{self}.snap")
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(SnapshotId)
            .map_err(|_| Error::Config {
                reason: format!("invalid snapshot id: {s:?}"),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotKind {
    Full,
    Incremental { parent: SnapshotId },
}

impl SnapshotKind {
    pub fn parent(&self) -> Option<SnapshotId> {
        match self {
            SnapshotKind::Full => None,
            SnapshotKind::Incremental { parent } => Some(*parent),
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotKind::Full => f.write_str("full"),
            SnapshotKind::Incremental { parent } => write!(f, "incremental (parent {parent})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    Stored,
    Delta,
}

/// File bytes as held in a snapshot: the whole content, or a delta against the
/// same path's content in the parent tree.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Stored(Vec<u8>),
    Delta(Vec<u8>),
}

impl Payload {
    pub fn storage_mode(&self) -> StorageMode {
        match self {
            Payload::Stored(_) => StorageMode::Stored,
            Payload::Delta(_) => StorageMode::Delta,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Stored(data) | Payload::Delta(data) => data,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Stored(data) => write!(f, "Stored({} bytes)", data.len()),
            Payload::Delta(data) => write!(f, "Delta({} bytes)", data.len()),
        }
    }
}

/// One file within a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    /// Fingerprint of the reconstructed content, never of delta bytes.
    pub fingerprint: Fingerprint,
    pub payload: Payload,
}

impl Entry {
    pub fn storage_mode(&self) -> StorageMode {
        self.payload.storage_mode()
    }
}

/// A point-in-time backup unit, exactly as carried inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub label: Option<String>,
    pub description: Option<String>,
    pub entries: BTreeMap<String, Entry>,
    /// Paths present in the parent tree that no longer exist.
    pub removed: BTreeSet<String>,
}

impl Snapshot {
    pub fn new(id: SnapshotId, kind: SnapshotKind) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            kind,
            label: None,
            description: None,
            entries: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn source_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

/// Catalog row describing a registered snapshot and its container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub verified: bool,
    pub encrypted: bool,
    /// Fingerprint of the whole container file.
    pub checksum: Fingerprint,
    pub entry_count: usize,
    pub removed_count: usize,
    /// Container size on disk.
    pub stored_bytes: u64,
    /// Sum of the sizes of the files carried by this snapshot.
    pub source_bytes: u64,
}

impl SnapshotRecord {
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id,
            timestamp: self.timestamp,
            kind: self.kind,
            verified: self.verified,
            label: self.label.clone(),
        }
    }
}

/// History listing row handed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub verified: bool,
    pub label: Option<String>,
}

/// Check a relative snapshot path before anything is written under it.
/// Rejects absolute paths, `..` components and empty segments so a container can
/// never direct a restore outside its destination.
pub fn validate_relative_path(path: &str) -> Result<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\0')
        || path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        || !native_name_safe(path);
    if bad {
        return Err(Error::decode(format!("unsafe entry path: {path:?}")));
    }
    Ok(())
}

/// Backslashes and colons are ordinary file name bytes on Unix, but separators
/// and drive or stream prefixes on Windows.
#[cfg(windows)]
fn native_name_safe(path: &str) -> bool {
    !path.contains('\\') && !path.contains(':')
}

#[cfg(not(windows))]
fn native_name_safe(_path: &str) -> bool {
    true
}
