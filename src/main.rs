use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use snapkeep::logging::init_logging;
use snapkeep::{
    BackupOptions, CancelToken, Passphrase, RestoreOptions, Scheduler, SnapshotId, Vault,
    VaultConfig,
};

#[derive(Parser)]
#[command(name = "snapkeep", about = "Incremental, verified directory snapshots")]
struct Cli {
    /// Directory holding catalogs and snapshot containers
    #[arg(long, global = true, env = "SNAPKEEP_STORE", default_value = ".snapkeep")]
    store: PathBuf,
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Environment variable holding the encryption passphrase
    #[arg(long, global = true, default_value = "SNAPKEEP_PASSPHRASE")]
    passphrase_env: String,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot a directory
    Backup {
        /// Directory to back up
        target: PathBuf,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Take a full snapshot even if an incremental is possible
        #[arg(long)]
        full: bool,
    },
    /// Restore a snapshot into a directory
    Restore {
        /// Directory the snapshot was taken of
        target: PathBuf,
        /// Where to write the restored files
        destination: PathBuf,
        /// Snapshot id (defaults to the newest verified snapshot)
        #[arg(long)]
        snapshot: Option<SnapshotId>,
        /// Restore only these paths or directories (repeatable)
        #[arg(long = "only")]
        only: Vec<String>,
        /// Write nothing unless every selected file verifies
        #[arg(long)]
        all_or_nothing: bool,
    },
    /// List snapshots of a directory
    List { target: PathBuf },
    /// Rebuild a snapshot in memory and check every file
    Verify {
        target: PathBuf,
        /// Snapshot id (defaults to the newest)
        #[arg(long)]
        snapshot: Option<SnapshotId>,
    },
    /// Delete one snapshot
    Delete { target: PathBuf, snapshot: SnapshotId },
    /// Delete all but the newest snapshots and what they depend on
    Prune {
        target: PathBuf,
        #[arg(long)]
        keep: usize,
    },
    /// Back up directories periodically until interrupted
    Schedule {
        /// Directories to back up
        #[arg(required = true)]
        targets: Vec<PathBuf>,
        /// Seconds between backups of each directory
        #[arg(long, default_value_t = 3600)]
        every: u64,
    },
}

fn open_vault(cli: &Cli) -> anyhow::Result<Vault> {
    let config = match &cli.config {
        Some(path) => VaultConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => VaultConfig::default(),
    };
    let vault = Vault::open(&cli.store, config)
        .with_context(|| format!("opening store {}", cli.store.display()))?;
    match std::env::var(&cli.passphrase_env) {
        Ok(secret) if !secret.is_empty() => Ok(vault.with_passphrase(Passphrase::new(secret)?)),
        _ => Ok(vault),
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: &CancelToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping after the current file...");
            token.cancel();
        }
    });
}

fn latest(vault: &Vault, target: &Path) -> anyhow::Result<SnapshotId> {
    match vault.list_snapshots(target)?.last() {
        Some(summary) => Ok(summary.id),
        None => bail!("no snapshots recorded for {}", target.display()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let vault = open_vault(&cli)?;

    match cli.command {
        Commands::Backup {
            target,
            label,
            description,
            full,
        } => {
            println!("Backing up...");
            println!("  Target: {}", target.display());
            println!("  Store: {}", vault.root().display());

            let options = BackupOptions {
                label,
                description,
                force_full: full,
                cancel: CancelToken::new(),
            };
            cancel_on_interrupt(&options.cancel);
            let start = Instant::now();
            let report = vault
                .run_backup(&target, options)
                .await
                .with_context(|| format!("backing up {}", target.display()))?;
            let elapsed = start.elapsed();

            println!("\nSnapshot {} registered ({})", report.id, report.kind);
            println!(
                "  Files scanned: {} ({} bytes)",
                report.files_scanned, report.scanned_bytes
            );
            println!("  Stored whole: {}", report.stored);
            println!("  Stored as delta: {}", report.deltas);
            println!("  Unchanged: {}", report.unchanged);
            println!("  Removed: {}", report.removed);
            println!("  Container size: {} bytes", report.container_bytes);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Restore {
            target,
            destination,
            snapshot,
            only,
            all_or_nothing,
        } => {
            println!("Restoring...");
            println!("  Target: {}", target.display());
            println!("  Destination: {}", destination.display());

            let options = RestoreOptions {
                snapshot,
                filter: (!only.is_empty()).then_some(only),
                all_or_nothing: all_or_nothing.then_some(true),
                cancel: CancelToken::new(),
            };
            cancel_on_interrupt(&options.cancel);
            let start = Instant::now();
            let report = vault
                .run_restore(&target, &destination, options)
                .await
                .with_context(|| format!("restoring {}", target.display()))?;
            let elapsed = start.elapsed();

            println!("\nSnapshot {} restored", report.snapshot);
            println!("  Files restored: {}", report.restored.len());
            for failure in &report.failed {
                println!("  FAILED {}: {}", failure.path, failure.error);
            }
            for item in &report.unmatched {
                println!("  No match for {item}");
            }
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

            if !report.complete {
                bail!("restore interrupted before all files were written");
            }
            if !report.failed.is_empty() {
                bail!("{} file(s) could not be restored", report.failed.len());
            }
        }
        Commands::List { target } => {
            let records = vault.records(&target)?;
            if records.is_empty() {
                println!("No snapshots for {}", target.display());
            }
            for record in records {
                println!(
                    "{}  {}  {:<16}  {:>6} files  {:>10} bytes{}{}",
                    record.id,
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.kind.to_string(),
                    record.entry_count,
                    record.stored_bytes,
                    if record.encrypted { "  encrypted" } else { "" },
                    record
                        .label
                        .as_deref()
                        .map(|l| format!("  [{l}]"))
                        .unwrap_or_default(),
                );
            }
            println!("Total: {} bytes", vault.total_size(&target)?);
        }
        Commands::Verify { target, snapshot } => {
            let id = match snapshot {
                Some(id) => id,
                None => latest(&vault, &target)?,
            };
            let start = Instant::now();
            let ok = vault.verify(&target, id).await?;
            if !ok {
                bail!("snapshot {id} failed verification");
            }
            println!(
                "Snapshot {id} verified in {:.3}s",
                start.elapsed().as_secs_f64()
            );
        }
        Commands::Delete { target, snapshot } => {
            let record = vault.delete(&target, snapshot)?;
            println!("Deleted snapshot {} ({} bytes)", record.id, record.stored_bytes);
        }
        Commands::Prune { target, keep } => {
            let removed = vault.prune(&target, keep)?;
            println!("Removed {} snapshot(s)", removed.len());
            for id in removed {
                println!("  {id}");
            }
        }
        Commands::Schedule { targets, every } => {
            let mut scheduler = Scheduler::from_config(vault.clone());
            for target in &targets {
                scheduler
                    .schedule(target, Duration::from_secs(every))
                    .with_context(|| format!("scheduling {}", target.display()))?;
                println!("Scheduled {} every {every}s", target.display());
            }
            scheduler.start()?;
            println!("Scheduler running; press Ctrl-C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            scheduler.stop().await?;
            println!("Scheduler stopped.");
        }
    }

    Ok(())
}
