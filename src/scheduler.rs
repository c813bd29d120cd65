//! Periodic backups. A `Scheduler` owns its own tokio task between `start`
//! and `stop`; nothing runs unless it is started.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backup::BackupOptions;
use crate::control::CancelToken;
use crate::error::{Error, Result};
use crate::vault::Vault;

/// A recurring backup of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBackup {
    pub target: PathBuf,
    pub interval: Duration,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    step: chrono::Duration,
}

type Jobs = Arc<Mutex<BTreeMap<PathBuf, ScheduledBackup>>>;

struct Running {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    vault: Vault,
    tick: Duration,
    jobs: Jobs,
    running: Option<Running>,
}

impl Scheduler {
    pub fn new(vault: Vault, tick: Duration) -> Self {
        Self {
            vault,
            tick,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            running: None,
        }
    }

    /// Scheduler ticking at the vault's configured period.
    pub fn from_config(vault: Vault) -> Self {
        let tick = Duration::from_secs(vault.config().scheduler_tick_secs);
        Self::new(vault, tick)
    }

    /// Back up `target` every `interval`, starting at the next tick.
    /// Scheduling a target again replaces its interval.
    pub fn schedule(&self, target: &Path, interval: Duration) -> Result<ScheduledBackup> {
        if interval.is_zero() {
            return Err(Error::Config {
                reason: "schedule interval must be positive".into(),
            });
        }
        let step = chrono::Duration::from_std(interval).map_err(|e| Error::Config {
            reason: format!("schedule interval {interval:?}: {e}"),
        })?;
        let now = Utc::now();
        if now.checked_add_signed(step).is_none() {
            return Err(Error::Config {
                reason: format!("schedule interval {interval:?} is too long"),
            });
        }

        let repo = self.vault.repository(target)?;
        let job = ScheduledBackup {
            target: repo.target().to_path_buf(),
            interval,
            next_run: now,
            last_run: None,
            step,
        };
        self.lock_jobs().insert(job.target.clone(), job.clone());
        info!(target = %job.target.display(), ?interval, "backup scheduled");
        Ok(job)
    }

    /// Stop scheduling `target`. Returns whether it was scheduled.
    pub fn unschedule(&self, target: &Path) -> bool {
        let key = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());
        let removed = self.lock_jobs().remove(&key).is_some();
        if removed {
            info!(target = %key.display(), "backup unscheduled");
        }
        removed
    }

    pub fn jobs(&self) -> Vec<ScheduledBackup> {
        self.lock_jobs().values().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the ticking task on the current tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::SchedulerRunning);
        }
        let (shutdown, signal) = oneshot::channel();
        let handle = tokio::spawn(run_loop(
            self.vault.clone(),
            Arc::clone(&self.jobs),
            self.tick,
            signal,
        ));
        self.running = Some(Running { shutdown, handle });
        info!(tick = ?self.tick, "scheduler started");
        Ok(())
    }

    /// Cancel in-flight scheduled backups and wait for the task to exit.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        // The loop may already have exited; a closed channel is fine.
        let _ = running.shutdown.send(());
        running.handle.await?;
        info!("scheduler stopped");
        Ok(())
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, ScheduledBackup>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_loop(vault: Vault, jobs: Jobs, tick: Duration, mut shutdown: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let cancel = CancelToken::new();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                for target in take_due(&jobs, Utc::now()) {
                    in_flight.spawn(scheduled_backup(vault.clone(), target, cancel.clone()));
                }
            }
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = done {
                    warn!(error = %e, "scheduled backup task failed");
                }
            }
        }
    }

    cancel.cancel();
    while let Some(done) = in_flight.join_next().await {
        if let Err(e) = done {
            warn!(error = %e, "scheduled backup task failed");
        }
    }
}

/// Targets due at `now`, with their next run pushed one interval ahead.
fn take_due(jobs: &Jobs, now: DateTime<Utc>) -> Vec<PathBuf> {
    let mut jobs = jobs.lock().unwrap_or_else(PoisonError::into_inner);
    let mut due = Vec::new();
    for job in jobs.values_mut() {
        if job.next_run <= now {
            job.last_run = Some(now);
            job.next_run = now
                .checked_add_signed(job.step)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            due.push(job.target.clone());
        }
    }
    due
}

async fn scheduled_backup(vault: Vault, target: PathBuf, cancel: CancelToken) {
    let options = BackupOptions {
        label: Some("scheduled".into()),
        cancel,
        ..BackupOptions::default()
    };
    debug!(target = %target.display(), "scheduled backup due");
    match vault.run_backup(&target, options).await {
        Ok(report) => info!(target = %target.display(), id = %report.id, "scheduled backup done"),
        Err(Error::Busy { .. }) => {
            info!(target = %target.display(), "previous backup still running; skipped")
        }
        Err(Error::Cancelled) => debug!(target = %target.display(), "scheduled backup cancelled"),
        Err(e) => warn!(target = %target.display(), error = %e, "scheduled backup failed"),
    }
}
