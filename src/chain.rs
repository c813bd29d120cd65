//! Folding a decoded snapshot chain into the tree it describes.

use std::collections::BTreeMap;

use crate::delta;
use crate::error::{Error, Result};
use crate::hasher::{self, Fingerprint};
use crate::snapshot::{Payload, Snapshot, SnapshotId, SnapshotKind};

/// What the tree holds at one path, as of the end of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathState {
    pub size: u64,
    pub mode: u32,
    pub fingerprint: Fingerprint,
    /// Snapshot that last recorded this path.
    pub snapshot: SnapshotId,
}

/// A chain of snapshots, nearest full snapshot first.
#[derive(Debug, Default)]
pub struct ChainView {
    snapshots: Vec<Snapshot>,
    tree: BTreeMap<String, PathState>,
}

impl ChainView {
    /// View with no snapshots; every path is absent.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a view, checking that each snapshot's parent is its predecessor.
    pub fn build(snapshots: Vec<Snapshot>) -> Result<Self> {
        let mut tree: BTreeMap<String, PathState> = BTreeMap::new();
        let mut previous: Option<SnapshotId> = None;

        for snap in &snapshots {
            match (snap.kind, previous) {
                (SnapshotKind::Full, None) => {}
                (SnapshotKind::Incremental { parent }, Some(prev)) if parent == prev => {}
                (SnapshotKind::Incremental { parent }, _) => {
                    return Err(Error::BrokenChain { missing: parent })
                }
                (SnapshotKind::Full, Some(_)) => {
                    return Err(Error::CatalogInvariant {
                        reason: format!("full snapshot {} in the middle of a chain", snap.id),
                    })
                }
            }

            for path in &snap.removed {
                tree.remove(path);
            }
            for entry in snap.entries.values() {
                tree.insert(
                    entry.path.clone(),
                    PathState {
                        size: entry.size,
                        mode: entry.mode,
                        fingerprint: entry.fingerprint,
                        snapshot: snap.id,
                    },
                );
            }
            previous = Some(snap.id);
        }

        Ok(Self { snapshots, tree })
    }

    /// Id of the last snapshot in the chain.
    pub fn target(&self) -> Option<SnapshotId> {
        self.snapshots.last().map(|s| s.id)
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn get(&self, path: &str) -> Option<&PathState> {
        self.tree.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.tree.keys()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Rebuild a file by taking the last stored copy and replaying every later
    /// delta in chain order. `None` when the path is absent at the chain's end.
    pub fn reconstruct(&self, path: &str) -> Result<Option<Vec<u8>>> {
        if !self.tree.contains_key(path) {
            return Ok(None);
        }

        let start = self
            .snapshots
            .iter()
            .rposition(|snap| {
                matches!(
                    snap.entries.get(path).map(|e| &e.payload),
                    Some(Payload::Stored(_))
                )
            })
            .ok_or_else(|| {
                Error::corrupt_delta(format!("no stored copy of {path} anywhere in the chain"))
            })?;

        let mut current: Option<Vec<u8>> = None;
        for snap in &self.snapshots[start..] {
            if snap.removed.contains(path) {
                current = None;
            }
            let Some(entry) = snap.entries.get(path) else {
                continue;
            };
            current = Some(match &entry.payload {
                Payload::Stored(data) => data.clone(),
                Payload::Delta(patch) => {
                    let base = current.as_deref().ok_or_else(|| {
                        Error::corrupt_delta(format!(
                            "delta for {path} in snapshot {} has no base",
                            snap.id
                        ))
                    })?;
                    delta::apply(base, patch)?
                }
            });
        }
        Ok(current)
    }

    /// Reconstruct and check the result against the recorded fingerprint.
    pub fn reconstruct_verified(&self, path: &str) -> Result<Vec<u8>> {
        let state = *self.tree.get(path).ok_or_else(|| Error::CatalogInvariant {
            reason: format!("{path} is not part of the snapshot"),
        })?;
        let snapshot = self.target().unwrap_or(state.snapshot);
        let data = self.reconstruct(path)?.ok_or_else(|| {
            Error::corrupt_delta(format!("{path} vanished during reconstruction"))
        })?;

        let actual = hasher::fingerprint(&data);
        if actual != state.fingerprint {
            return Err(Error::Integrity {
                snapshot,
                path: path.to_string(),
                expected: state.fingerprint,
                actual,
            });
        }
        Ok(data)
    }
}
