//! The public entry point: one store root, many targets.
//!
//! Every blocking stage runs inside `spawn_blocking`, so a `Vault` can be
//! cloned into any number of tokio tasks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::backup::{self, BackupOptions, BackupReport};
use crate::config::VaultConfig;
use crate::crypto::Passphrase;
use crate::error::{Error, IoContext, Result, RunKind};
use crate::repository::Repository;
use crate::restore::{self, RestoreOptions, RestoreReport};
use crate::snapshot::{SnapshotId, SnapshotRecord, SnapshotSummary};

#[derive(Debug, Clone)]
pub struct Vault {
    inner: Arc<VaultInner>,
}

#[derive(Debug)]
struct VaultInner {
    root: PathBuf,
    config: VaultConfig,
    passphrase: Option<Passphrase>,
    repos: Arc<Mutex<HashMap<PathBuf, Arc<Repository>>>>,
}

impl Vault {
    /// Open (creating if needed) the store at `root`.
    pub fn open(root: impl AsRef<Path>, config: VaultConfig) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref();
        std::fs::create_dir_all(root).at(root)?;
        let root = root.canonicalize().at(root)?;
        info!(store = %root.display(), "vault opened");
        Ok(Self {
            inner: Arc::new(VaultInner {
                root,
                config,
                passphrase: None,
                repos: Arc::new(Mutex::new(HashMap::new())),
            }),
        })
    }

    /// Encrypt new containers and decrypt existing ones with `passphrase`.
    pub fn with_passphrase(self, passphrase: Passphrase) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => VaultInner {
                passphrase: Some(passphrase),
                ..inner
            },
            Err(shared) => VaultInner {
                root: shared.root.clone(),
                config: shared.config.clone(),
                passphrase: Some(passphrase),
                repos: Arc::clone(&shared.repos),
            },
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &VaultConfig {
        &self.inner.config
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.passphrase.is_some()
    }

    /// The repository for `target`, opened once and shared afterwards.
    pub fn repository(&self, target: &Path) -> Result<Arc<Repository>> {
        let canonical = target.canonicalize().at(target)?;
        let mut repos = self
            .inner
            .repos
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(repo) = repos.get(&canonical) {
            return Ok(Arc::clone(repo));
        }
        let repo = Arc::new(Repository::open(&self.inner.root, &canonical)?);
        repos.insert(canonical, Arc::clone(&repo));
        Ok(repo)
    }

    /// Catalog records for `target`, oldest first.
    pub fn records(&self, target: &Path) -> Result<Vec<SnapshotRecord>> {
        let repo = self.repository(target)?;
        let records = repo.sync_catalog()?.list().cloned().collect();
        Ok(records)
    }

    pub fn list_snapshots(&self, target: &Path) -> Result<Vec<SnapshotSummary>> {
        Ok(self
            .records(target)?
            .iter()
            .map(SnapshotRecord::summary)
            .collect())
    }

    /// Snapshot `target` into the store.
    pub async fn run_backup(&self, target: &Path, options: BackupOptions) -> Result<BackupReport> {
        let repo = self.repository(target)?;
        let guard = repo.try_lock(RunKind::Backup)?;
        let vault = self.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            backup::create_snapshot(
                &repo,
                &vault.inner.config,
                vault.inner.passphrase.as_ref(),
                &options,
            )
        })
        .await?
    }

    /// Restore a snapshot of `target` into `destination`.
    pub async fn run_restore(
        &self,
        target: &Path,
        destination: &Path,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let repo = self.repository(target)?;
        let guard = repo.try_lock(RunKind::Restore)?;
        let vault = self.clone();
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            restore::restore_snapshot(
                &repo,
                &vault.inner.config,
                vault.inner.passphrase.as_ref(),
                &destination,
                &options,
            )
        })
        .await?
    }

    /// Check that snapshot `id` decodes and every file in it rebuilds to its
    /// recorded fingerprint. Integrity failures are reported as `Ok(false)`.
    pub async fn verify(&self, target: &Path, id: SnapshotId) -> Result<bool> {
        let repo = self.repository(target)?;
        if !repo.sync_catalog()?.contains(id) {
            return Err(Error::NotFound { id });
        }
        let vault = self.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let view = repo.load_chain(id, vault.inner.passphrase.as_ref())?;
            for path in view.paths() {
                view.reconstruct_verified(path)?;
            }
            Ok::<_, Error>(view.len())
        })
        .await?;

        match outcome {
            Ok(files) => {
                info!(%id, files, "snapshot verified");
                Ok(true)
            }
            Err(e) if e.is_integrity_failure() => {
                warn!(%id, error = %e, "snapshot failed verification");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove one snapshot. Refused while another snapshot builds on it.
    pub fn delete(&self, target: &Path, id: SnapshotId) -> Result<SnapshotRecord> {
        let repo = self.repository(target)?;
        let _guard = repo.try_lock(RunKind::Backup)?;
        let record = repo.catalog().remove(id)?;
        repo.remove_container(id)?;
        info!(%id, "snapshot deleted");
        Ok(record)
    }

    /// Keep the newest `keep_last` snapshots and whatever they need; delete the rest.
    pub fn prune(&self, target: &Path, keep_last: usize) -> Result<Vec<SnapshotId>> {
        let repo = self.repository(target)?;
        let _guard = repo.try_lock(RunKind::Backup)?;
        let doomed = repo.sync_catalog()?.plan_prune(keep_last);
        for &id in &doomed {
            repo.catalog().remove(id)?;
            repo.remove_container(id)?;
        }
        info!(removed = doomed.len(), keep_last, "prune finished");
        Ok(doomed)
    }

    /// Container bytes currently held for `target`.
    pub fn total_size(&self, target: &Path) -> Result<u64> {
        let repo = self.repository(target)?;
        let total = repo.sync_catalog()?.total_stored_bytes();
        Ok(total)
    }
}
