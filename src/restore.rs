//! Restore orchestration: resolve the chain, then rebuild, verify and write
//! each selected file. Nothing unverified reaches the destination.

use std::path::Path;

use rayon::prelude::*;
use tracing::{info, info_span, warn};

use crate::chain::ChainView;
use crate::config::VaultConfig;
use crate::control::CancelToken;
use crate::crypto::Passphrase;
use crate::error::{Error, IoContext, Result};
use crate::repository::Repository;
use crate::snapshot::SnapshotId;
use crate::util;

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Snapshot to restore; the newest verified one when `None`.
    pub snapshot: Option<SnapshotId>,
    /// Relative paths or directory prefixes to restore; everything when `None`.
    pub filter: Option<Vec<String>>,
    /// Overrides the configured all-or-nothing behaviour.
    pub all_or_nothing: Option<bool>,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct RestoreFailure {
    pub path: String,
    pub error: Error,
}

#[derive(Debug)]
pub struct RestoreReport {
    pub snapshot: SnapshotId,
    /// Paths written to the destination, sorted.
    pub restored: Vec<String>,
    pub failed: Vec<RestoreFailure>,
    /// Filter items that matched nothing in the snapshot.
    pub unmatched: Vec<String>,
    /// False when the run was cancelled before every selected path was handled.
    pub complete: bool,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.complete && self.failed.is_empty()
    }
}

/// Whether `path` is selected by `item`: the same path, or a file beneath it.
fn selects(item: &str, path: &str) -> bool {
    let item = item.trim_end_matches('/');
    item.is_empty()
        || path == item
        || (path.len() > item.len() && path.starts_with(item) && path.as_bytes()[item.len()] == b'/')
}

/// Pick the paths of `view` that the filter asks for, plus the filter items
/// that selected nothing.
pub fn select_paths(view: &ChainView, filter: Option<&[String]>) -> (Vec<String>, Vec<String>) {
    match filter {
        None => (view.paths().cloned().collect(), Vec::new()),
        Some(items) => {
            let selected = view
                .paths()
                .filter(|p| items.iter().any(|item| selects(item, p)))
                .cloned()
                .collect();
            let unmatched = items
                .iter()
                .filter(|item| !view.paths().any(|p| selects(item, p)))
                .cloned()
                .collect();
            (selected, unmatched)
        }
    }
}

/// Restore a snapshot of the repository's target into `destination`.
pub fn restore_snapshot(
    repo: &Repository,
    config: &VaultConfig,
    passphrase: Option<&Passphrase>,
    destination: &Path,
    options: &RestoreOptions,
) -> Result<RestoreReport> {
    let id = {
        let catalog = repo.sync_catalog()?;
        let id = match options.snapshot {
            Some(id) => id,
            None => catalog.latest_verified().ok_or_else(|| Error::NoSnapshots {
                target: repo.target().to_path_buf(),
            })?,
        };
        if !catalog.contains(id) {
            return Err(Error::NotFound { id });
        }
        id
    };

    let span = info_span!("restore", %id, destination = %destination.display());
    let _enter = span.enter();
    let cancel = &options.cancel;
    let all_or_nothing = options.all_or_nothing.unwrap_or(config.all_or_nothing);

    // A broken chain is fatal: no partial reconstruction.
    let view = repo.load_chain(id, passphrase)?;
    let (selected, unmatched) = select_paths(&view, options.filter.as_deref());
    for item in &unmatched {
        warn!(filter = %item, "filter matched nothing in snapshot");
    }
    info!(files = selected.len(), "restoring");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| Error::Config {
            reason: format!("cannot start worker pool: {e}"),
        })?;

    // With all-or-nothing, check every file before the first write. The bytes
    // are dropped here and rebuilt again below.
    if all_or_nothing {
        let checked = pool.install(|| {
            selected.par_iter().try_for_each(|path| {
                cancel.check()?;
                view.reconstruct_verified(path).map(drop)
            })
        });
        if let Err(e) = checked {
            if !matches!(e, Error::Cancelled) {
                warn!(error = %e, "all-or-nothing restore aborted before writing");
            }
            return Err(e);
        }
    }

    // Rebuild, verify and write each file in one step. Content that fails its
    // fingerprint is never written.
    std::fs::create_dir_all(destination).at(destination)?;
    let written: Vec<(String, Option<Result<()>>)> = pool.install(|| {
        selected
            .into_par_iter()
            .map(|path| {
                if cancel.is_cancelled() {
                    return (path, None);
                }
                let outcome = view
                    .reconstruct_verified(&path)
                    .and_then(|data| write_file(destination, &path, &data, &view));
                (path, Some(outcome))
            })
            .collect()
    });

    let mut report = RestoreReport {
        snapshot: id,
        restored: Vec::new(),
        failed: Vec::new(),
        unmatched,
        complete: true,
    };
    for (path, outcome) in written {
        match outcome {
            None => report.complete = false,
            Some(Ok(())) => report.restored.push(path),
            Some(Err(error)) => {
                warn!(%path, %error, "file not restored");
                report.failed.push(RestoreFailure { path, error });
            }
        }
    }
    report.restored.sort();
    report.failed.sort_by(|a, b| a.path.cmp(&b.path));

    info!(
        restored = report.restored.len(),
        failed = report.failed.len(),
        complete = report.complete,
        "restore finished"
    );
    Ok(report)
}

fn write_file(destination: &Path, path: &str, data: &[u8], view: &ChainView) -> Result<()> {
    let full = destination.join(path);
    util::write_atomic(&full, data)?;
    if let Some(state) = view.get(path) {
        util::set_file_mode(&full, state.mode)?;
    }
    Ok(())
}
