//! On-disk layout for one backup target inside a store:
//!
//! ```text
//! <store>/<target-key>/target.txt        canonical path of the target
//! <store>/<target-key>/catalog.jsonl     snapshot history
//! <store>/<target-key>/snapshots/N.snap  one container per snapshot
//! <store>/<target-key>/backup.lock       held by backups, deletes and prunes
//! <store>/<target-key>/restore.lock      held by restores
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::catalog::Catalog;
use crate::chain::ChainView;
use crate::codec;
use crate::crypto::Passphrase;
use crate::control::RunGuard;
use crate::error::{Error, IoContext, Result, RunKind};
use crate::hasher;
use crate::snapshot::{Snapshot, SnapshotId, SnapshotRecord};
use crate::util;

const CATALOG_FILE: &str = "catalog.jsonl";
const TARGET_FILE: &str = "target.txt";
const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug)]
pub struct Repository {
    store_root: PathBuf,
    target: PathBuf,
    dir: PathBuf,
    catalog: Mutex<Catalog>,
}

/// Directory name for a target: a short digest of its canonical path.
pub fn target_key(target: &Path) -> String {
    let digest = hasher::fingerprint(target.to_string_lossy().as_bytes());
    digest.to_hex()[..16].to_string()
}

impl Repository {
    /// Open the repository for `target` (which must exist) under `store_root`.
    pub fn open(store_root: &Path, target: &Path) -> Result<Self> {
        let target = target.canonicalize().at(target)?;
        let dir = store_root.join(target_key(&target));
        std::fs::create_dir_all(dir.join(SNAPSHOT_DIR)).at(&dir)?;

        let marker = dir.join(TARGET_FILE);
        if !marker.exists() {
            std::fs::write(&marker, target.to_string_lossy().as_bytes()).at(&marker)?;
        }

        let catalog = Catalog::open(&dir.join(CATALOG_FILE))?;
        debug!(target = %target.display(), dir = %dir.display(), "repository opened");
        Ok(Self {
            store_root: store_root.to_path_buf(),
            target,
            dir,
            catalog: Mutex::new(catalog),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The store this repository lives in. Backups never descend into it.
    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    /// Claim this target for a run of `kind`; `Busy` if any handle to the
    /// store already holds it.
    pub fn try_lock(&self, kind: RunKind) -> Result<RunGuard> {
        let name = match kind {
            RunKind::Backup => "backup.lock",
            RunKind::Restore => "restore.lock",
        };
        RunGuard::try_acquire(&self.dir.join(name), &self.target, kind)
    }

    /// Lock the catalog. Hold the guard only for short lookups or one append.
    pub fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the catalog after re-reading it, so snapshots written through
    /// another handle to the store are visible.
    pub fn sync_catalog(&self) -> Result<MutexGuard<'_, Catalog>> {
        let mut catalog = self.catalog();
        catalog.reload()?;
        Ok(catalog)
    }

    pub fn container_path(&self, id: SnapshotId) -> PathBuf {
        self.dir.join(SNAPSHOT_DIR).join(id.container_name())
    }

    pub fn write_container(&self, id: SnapshotId, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.container_path(id);
        util::write_atomic(&path, bytes)?;
        Ok(path)
    }

    pub fn remove_container(&self, id: SnapshotId) -> Result<()> {
        let path = self.container_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Read a container and check it against the checksum the catalog recorded.
    pub fn read_container(&self, record: &SnapshotRecord) -> Result<Vec<u8>> {
        let path = self.container_path(record.id);
        let bytes = match util::read_file(&path) {
            Ok(bytes) => bytes,
            Err(Error::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BrokenChain { missing: record.id })
            }
            Err(e) => return Err(e),
        };
        let actual = hasher::fingerprint(&bytes);
        if actual != record.checksum {
            return Err(Error::ContainerChecksum {
                id: record.id,
                expected: record.checksum,
                actual,
            });
        }
        Ok(bytes)
    }

    pub fn load_snapshot(
        &self,
        record: &SnapshotRecord,
        passphrase: Option<&Passphrase>,
    ) -> Result<Snapshot> {
        let bytes = self.read_container(record)?;
        let snapshot = codec::decode(&bytes, passphrase)?;
        if snapshot.id != record.id || snapshot.kind != record.kind {
            return Err(Error::decode(format!(
                "container {} holds snapshot {} ({})",
                record.id, snapshot.id, snapshot.kind
            )));
        }
        Ok(snapshot)
    }

    /// Decode the whole chain ending at `id` into a reconstructable view.
    pub fn load_chain(&self, id: SnapshotId, passphrase: Option<&Passphrase>) -> Result<ChainView> {
        let records = self.sync_catalog()?.chain_to(id)?;
        let snapshots = records
            .iter()
            .map(|record| self.load_snapshot(record, passphrase))
            .collect::<Result<Vec<_>>>()?;
        ChainView::build(snapshots)
    }
}
