//! Append-only snapshot history for one target.
//!
//! Persisted as JSON Lines next to the containers: every mutation appends one
//! event, and opening replays them. Listing history never touches a container.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, IoContext, Result};
use crate::snapshot::{SnapshotId, SnapshotKind, SnapshotRecord};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum CatalogEvent {
    Appended { record: SnapshotRecord },
    Removed { id: SnapshotId },
}

#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    records: BTreeMap<SnapshotId, SnapshotRecord>,
    /// Highest id ever appended, including removed ones.
    high_water: Option<SnapshotId>,
    /// Bytes of the file made of complete, newline-terminated events.
    committed_len: u64,
}

impl Catalog {
    /// Open (or start) the catalog stored at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut catalog = Catalog {
            path: path.to_path_buf(),
            records: BTreeMap::new(),
            high_water: None,
            committed_len: 0,
        };

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(catalog),
            Err(e) => return Err(Error::io(path, e)),
        };

        // Only newline-terminated events count. An unterminated tail is an
        // append that never finished; the next write truncates it away.
        let committed = text.rfind('\n').map_or(0, |i| i + 1);
        if committed < text.len() {
            warn!(
                path = %path.display(),
                bytes = text.len() - committed,
                "ignoring torn catalog tail"
            );
        }

        for (idx, line) in text[..committed].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: CatalogEvent = serde_json::from_str(line).map_err(|e| {
                Error::decode(format!("{} line {}: {e}", path.display(), idx + 1))
            })?;
            catalog.replay(event)?;
        }
        catalog.committed_len = committed as u64;

        debug!(
            path = %path.display(),
            snapshots = catalog.records.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    /// Re-read the file, picking up events written through other handles.
    pub fn reload(&mut self) -> Result<()> {
        *self = Catalog::open(&self.path)?;
        Ok(())
    }

    fn replay(&mut self, event: CatalogEvent) -> Result<()> {
        match event {
            CatalogEvent::Appended { record } => {
                let id = record.id;
                if self.records.insert(id, record).is_some() {
                    return Err(Error::CatalogInvariant {
                        reason: format!("snapshot {id} appended twice"),
                    });
                }
                self.high_water = self.high_water.max(Some(id));
            }
            CatalogEvent::Removed { id } => {
                if self.records.remove(&id).is_none() {
                    warn!(%id, "catalog removes unknown snapshot");
                }
            }
        }
        Ok(())
    }

    /// Write one event after the last complete one. Callers hold the target's
    /// backup lock, so no other writer is active.
    fn persist(&mut self, event: &CatalogEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).map_err(|e| Error::Encode {
            reason: format!("catalog event: {e}"),
        })?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .at(&self.path)?;
        file.set_len(self.committed_len).at(&self.path)?;
        file.seek(SeekFrom::Start(self.committed_len)).at(&self.path)?;
        file.write_all(line.as_bytes()).at(&self.path)?;
        file.sync_data().at(&self.path)?;
        self.committed_len += line.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id the next appended snapshot must carry.
    pub fn next_id(&self) -> SnapshotId {
        self.high_water.map_or(SnapshotId(1), SnapshotId::next)
    }

    /// Register a verified snapshot. The file is re-read first, so ids taken
    /// through another handle are seen and never reused.
    pub fn append(&mut self, record: SnapshotRecord) -> Result<()> {
        self.reload()?;
        if !record.verified {
            return Err(Error::CatalogInvariant {
                reason: format!("snapshot {} is not verified", record.id),
            });
        }
        if record.id < self.next_id() {
            return Err(Error::CatalogInvariant {
                reason: format!(
                    "snapshot id {} does not follow {}",
                    record.id,
                    self.high_water.unwrap_or(SnapshotId(0))
                ),
            });
        }
        if let SnapshotKind::Incremental { parent } = record.kind {
            match self.records.get(&parent) {
                None => return Err(Error::BrokenChain { missing: parent }),
                Some(p) if !p.verified => {
                    return Err(Error::CatalogInvariant {
                        reason: format!("parent {parent} is not verified"),
                    })
                }
                Some(_) => {}
            }
        }

        let event = CatalogEvent::Appended { record };
        self.persist(&event)?;
        if let CatalogEvent::Appended { record } = event {
            self.high_water = Some(record.id);
            self.records.insert(record.id, record);
        }
        Ok(())
    }

    pub fn get(&self, id: SnapshotId) -> Option<&SnapshotRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: SnapshotId) -> bool {
        self.records.contains_key(&id)
    }

    /// Records ordered oldest first.
    pub fn list(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<SnapshotId> {
        self.records.keys().next_back().copied()
    }

    pub fn latest_verified(&self) -> Option<SnapshotId> {
        self.records
            .values()
            .rev()
            .find(|r| r.verified)
            .map(|r| r.id)
    }

    /// The chain needed to reconstruct `id`: nearest full snapshot first, `id` last.
    pub fn chain_to(&self, id: SnapshotId) -> Result<Vec<SnapshotRecord>> {
        let mut chain = Vec::new();
        let mut current = id;
        loop {
            let record = self
                .records
                .get(&current)
                .ok_or(Error::BrokenChain { missing: current })?;
            chain.push(record.clone());
            match record.kind {
                SnapshotKind::Full => break,
                SnapshotKind::Incremental { parent } => {
                    if parent >= current {
                        return Err(Error::CatalogInvariant {
                            reason: format!("snapshot {current} names later snapshot {parent} as parent"),
                        });
                    }
                    current = parent;
                }
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// Number of incrementals stacked on the nearest full snapshot, `id` included.
    pub fn chain_depth(&self, id: SnapshotId) -> Result<usize> {
        Ok(self.chain_to(id)?.len() - 1)
    }

    pub fn children_of(&self, id: SnapshotId) -> Vec<SnapshotId> {
        self.records
            .values()
            .filter(|r| r.kind.parent() == Some(id))
            .map(|r| r.id)
            .collect()
    }

    /// Remove a snapshot record. Refuses while any retained snapshot builds on it.
    pub fn remove(&mut self, id: SnapshotId) -> Result<SnapshotRecord> {
        self.reload()?;
        if !self.records.contains_key(&id) {
            return Err(Error::NotFound { id });
        }
        if let Some(&dependent) = self.children_of(id).first() {
            return Err(Error::RetentionConflict { id, dependent });
        }
        self.persist(&CatalogEvent::Removed { id })?;
        self.records.remove(&id).ok_or(Error::NotFound { id })
    }

    /// Snapshots that can go when keeping the newest `keep_last`, ordered so
    /// that removing them in sequence never orphans a remaining record.
    pub fn plan_prune(&self, keep_last: usize) -> Vec<SnapshotId> {
        let mut needed: BTreeSet<SnapshotId> = BTreeSet::new();
        for id in self.records.keys().rev().take(keep_last) {
            let mut current = Some(*id);
            while let Some(cur) = current {
                if !needed.insert(cur) {
                    break;
                }
                current = self.records.get(&cur).and_then(|r| r.kind.parent());
            }
        }
        self.records
            .keys()
            .rev()
            .filter(|id| !needed.contains(id))
            .copied()
            .collect()
    }

    /// Bytes used by all retained containers.
    pub fn total_stored_bytes(&self) -> u64 {
        self.records.values().map(|r| r.stored_bytes).sum()
    }
}
