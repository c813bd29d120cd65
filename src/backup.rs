//! Backup orchestration: scan, diff, encode, verify, register.
//!
//! Nothing reaches the catalog until the freshly encoded container has been
//! decoded again and every entry reconstructed and re-fingerprinted. A failed or
//! cancelled run leaves the catalog exactly as it found it.

use std::collections::BTreeSet;
use std::fmt;

use rayon::prelude::*;
use tracing::{debug, info, info_span, warn};

use crate::chain::ChainView;
use crate::codec;
use crate::config::VaultConfig;
use crate::control::CancelToken;
use crate::crypto::Passphrase;
use crate::delta;
use crate::error::{Error, Result};
use crate::hasher::{self, Fingerprint};
use crate::repository::Repository;
use crate::snapshot::{Entry, Payload, Snapshot, SnapshotId, SnapshotKind, SnapshotRecord};
use crate::util::{self, FileEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Idle,
    Scanning,
    Diffing,
    Encoding,
    Verifying,
    Registered,
    Failed,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupPhase::Idle => "idle",
            BackupPhase::Scanning => "scanning",
            BackupPhase::Diffing => "diffing",
            BackupPhase::Encoding => "encoding",
            BackupPhase::Verifying => "verifying",
            BackupPhase::Registered => "registered",
            BackupPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub label: Option<String>,
    pub description: Option<String>,
    /// Take a full snapshot even when an incremental would do.
    pub force_full: bool,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub id: SnapshotId,
    pub kind: SnapshotKind,
    pub files_scanned: usize,
    /// Size of the scanned tree as seen by the walk.
    pub scanned_bytes: u64,
    pub stored: usize,
    pub deltas: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub source_bytes: u64,
    pub container_bytes: u64,
}

enum FileOutcome {
    Unchanged,
    Changed(Entry),
}

struct BackupRun<'a> {
    repo: &'a Repository,
    config: &'a VaultConfig,
    passphrase: Option<&'a Passphrase>,
    options: &'a BackupOptions,
    phase: BackupPhase,
}

/// Snapshot the repository's target and register the result.
pub fn create_snapshot(
    repo: &Repository,
    config: &VaultConfig,
    passphrase: Option<&Passphrase>,
    options: &BackupOptions,
) -> Result<BackupReport> {
    let span = info_span!("backup", target = %repo.target().display());
    let _enter = span.enter();

    let mut run = BackupRun {
        repo,
        config,
        passphrase,
        options,
        phase: BackupPhase::Idle,
    };
    let result = run.execute();
    if let Err(e) = &result {
        run.advance(BackupPhase::Failed);
        warn!(error = %e, "backup failed; catalog unchanged");
    }
    result
}

impl BackupRun<'_> {
    fn advance(&mut self, phase: BackupPhase) {
        debug!(from = %self.phase, to = %phase, "backup phase");
        self.phase = phase;
    }

    fn execute(&mut self) -> Result<BackupReport> {
        let options = self.options;
        let cancel = &options.cancel;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| Error::Config {
                reason: format!("cannot start worker pool: {e}"),
            })?;

        // Stage 1: walk the tree and fingerprint every file in parallel.
        self.advance(BackupPhase::Scanning);
        let files = util::walk_files(
            self.repo.target(),
            &self.config.exclude,
            Some(self.repo.store_root()),
        )?;
        cancel.check()?;
        let fingerprints: Vec<Fingerprint> = pool.install(|| {
            files
                .par_iter()
                .map(|file| {
                    cancel.check()?;
                    hasher::fingerprint_file(&file.full_path)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        // Stage 2: pick full vs incremental against the newest verified snapshot.
        let (id, mut kind) = self.plan_kind()?;
        let parent_view = match kind {
            SnapshotKind::Full => ChainView::empty(),
            SnapshotKind::Incremental { parent } => {
                match self.repo.load_chain(parent, self.passphrase) {
                    Ok(view) => view,
                    Err(Error::BrokenChain { missing }) => {
                        warn!(%parent, %missing, "parent chain is broken; taking a full snapshot");
                        kind = SnapshotKind::Full;
                        ChainView::empty()
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        info!(%id, %kind, files = files.len(), "snapshot planned");

        // Stage 3: diff changed files against the parent tree.
        self.advance(BackupPhase::Diffing);
        let outcomes: Vec<FileOutcome> = pool.install(|| {
            files
                .par_iter()
                .zip(fingerprints.par_iter())
                .map(|(file, fp)| {
                    cancel.check()?;
                    self.classify(file, *fp, &parent_view)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut snapshot = Snapshot::new(id, kind);
        snapshot.label = options.label.clone();
        snapshot.description = options.description.clone();
        let mut unchanged = 0;
        for outcome in outcomes {
            match outcome {
                FileOutcome::Unchanged => unchanged += 1,
                FileOutcome::Changed(entry) => snapshot.insert(entry),
            }
        }
        let present: BTreeSet<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        snapshot.removed = parent_view
            .paths()
            .filter(|p| !present.contains(p.as_str()))
            .cloned()
            .collect();
        cancel.check()?;

        // Stage 4: encode.
        self.advance(BackupPhase::Encoding);
        let bytes = codec::encode(&snapshot, self.passphrase, self.config.compression_level)?;
        cancel.check()?;

        // Stage 5: decode what we just wrote and rebuild every entry from it.
        self.advance(BackupPhase::Verifying);
        self.verify_encoded(&snapshot, &bytes, &parent_view, &pool)?;
        cancel.check()?;

        // Stage 6: persist the container, then register it.
        let record = SnapshotRecord {
            id,
            timestamp: snapshot.timestamp,
            kind,
            label: snapshot.label.clone(),
            verified: true,
            encrypted: self.passphrase.is_some(),
            checksum: hasher::fingerprint(&bytes),
            entry_count: snapshot.entries.len(),
            removed_count: snapshot.removed.len(),
            stored_bytes: bytes.len() as u64,
            source_bytes: snapshot.source_bytes(),
        };
        self.repo.write_container(id, &bytes)?;
        if let Err(e) = self.repo.catalog().append(record) {
            if let Err(cleanup) = self.repo.remove_container(id) {
                warn!(%id, error = %cleanup, "could not remove unregistered container");
            }
            return Err(e);
        }
        self.advance(BackupPhase::Registered);

        let report = BackupReport {
            id,
            kind,
            files_scanned: files.len(),
            scanned_bytes: files.iter().map(|f| f.size).sum(),
            stored: snapshot
                .entries
                .values()
                .filter(|e| matches!(e.payload, Payload::Stored(_)))
                .count(),
            deltas: snapshot
                .entries
                .values()
                .filter(|e| matches!(e.payload, Payload::Delta(_)))
                .count(),
            unchanged,
            removed: snapshot.removed.len(),
            source_bytes: snapshot.source_bytes(),
            container_bytes: bytes.len() as u64,
        };
        info!(
            %id,
            stored = report.stored,
            deltas = report.deltas,
            unchanged = report.unchanged,
            removed = report.removed,
            bytes = report.container_bytes,
            "snapshot registered"
        );
        Ok(report)
    }

    fn plan_kind(&self) -> Result<(SnapshotId, SnapshotKind)> {
        let catalog = self.repo.sync_catalog()?;
        let id = catalog.next_id();
        let kind = match catalog.latest_verified() {
            None => SnapshotKind::Full,
            Some(_) if self.options.force_full => SnapshotKind::Full,
            Some(parent) => match catalog.chain_depth(parent) {
                Ok(depth) if depth + 1 > self.config.max_chain_len => {
                    info!(%parent, "chain length limit reached; taking a full snapshot");
                    SnapshotKind::Full
                }
                Ok(_) => SnapshotKind::Incremental { parent },
                Err(Error::BrokenChain { missing }) => {
                    warn!(%parent, %missing, "latest snapshot has a broken chain; taking a full snapshot");
                    SnapshotKind::Full
                }
                Err(e) => return Err(e),
            },
        };
        Ok((id, kind))
    }

    fn classify(
        &self,
        file: &FileEntry,
        scanned: Fingerprint,
        parent: &ChainView,
    ) -> Result<FileOutcome> {
        let previous = parent.get(&file.relative_path);
        if let Some(prev) = previous {
            if prev.fingerprint == scanned && prev.mode == file.mode {
                return Ok(FileOutcome::Unchanged);
            }
        }

        // Fingerprint what we actually read; the file may have moved on since the scan.
        let data = util::read_file(&file.full_path)?;
        let fingerprint = hasher::fingerprint(&data);

        let size = data.len() as u64;
        let payload = match previous {
            None => Payload::Stored(data),
            Some(prev) => {
                if prev.fingerprint == fingerprint && prev.mode == file.mode {
                    return Ok(FileOutcome::Unchanged);
                }
                let base = parent.reconstruct_verified(&file.relative_path)?;
                let patch = delta::diff(&base, &data);
                if self.config.prefer_delta(patch.len(), size) {
                    Payload::Delta(patch)
                } else {
                    Payload::Stored(data)
                }
            }
        };

        Ok(FileOutcome::Changed(Entry {
            path: file.relative_path.clone(),
            size,
            mode: file.mode,
            fingerprint,
            payload,
        }))
    }

    fn verify_encoded(
        &self,
        built: &Snapshot,
        bytes: &[u8],
        parent: &ChainView,
        pool: &rayon::ThreadPool,
    ) -> Result<()> {
        let decoded = codec::decode(bytes, self.passphrase)?;
        if &decoded != built {
            return Err(Error::decode(format!(
                "snapshot {} does not survive its own encoding",
                built.id
            )));
        }

        pool.install(|| {
            decoded.entries.par_iter().try_for_each(|(path, entry)| {
                self.options.cancel.check()?;
                let content = match &entry.payload {
                    Payload::Stored(data) => data.clone(),
                    Payload::Delta(patch) => {
                        let base = parent.reconstruct(path)?.ok_or_else(|| {
                            Error::corrupt_delta(format!("delta for {path} has no base"))
                        })?;
                        delta::apply(&base, patch)?
                    }
                };
                let actual = hasher::fingerprint(&content);
                if actual != entry.fingerprint || content.len() as u64 != entry.size {
                    return Err(Error::Integrity {
                        snapshot: built.id,
                        path: path.clone(),
                        expected: entry.fingerprint,
                        actual,
                    });
                }
                Ok(())
            })
        })
    }
}
