use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};

/// Engine tuning, loadable from a TOML file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultConfig {
    /// Worker threads for per-file hashing, diffing and reconstruction.
    pub workers: usize,
    /// zstd level for container payloads.
    pub compression_level: i32,
    /// Store a changed file whole when its delta exceeds this fraction of its size.
    pub max_delta_ratio: f64,
    /// Files smaller than this always keep their delta.
    pub small_file_threshold: u64,
    /// Incrementals allowed on one full snapshot before the next backup is full.
    pub max_chain_len: usize,
    /// File or directory names skipped during the walk (`*` wildcard allowed once).
    pub exclude: Vec<String>,
    /// Restore writes nothing unless every requested file verifies.
    pub all_or_nothing: bool,
    /// How often the scheduler checks for due backups, in seconds.
    pub scheduler_tick_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            compression_level: 3,
            max_delta_ratio: 0.7,
            small_file_threshold: 4096,
            max_chain_len: 32,
            exclude: Vec::new(),
            all_or_nothing: false,
            scheduler_tick_secs: 30,
        }
    }
}

impl VaultConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: VaultConfig = toml::from_str(&text).map_err(|e| Error::Config {
            reason: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;
        debug!(path = %path.display(), ?config, "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(Error::Config { reason });
        if self.workers == 0 {
            return fail("workers must be at least 1".into());
        }
        if !(1..=22).contains(&self.compression_level) {
            return fail(format!(
                "compression_level {} outside 1..=22",
                self.compression_level
            ));
        }
        if !(self.max_delta_ratio > 0.0 && self.max_delta_ratio <= 1.0) {
            return fail(format!(
                "max_delta_ratio {} outside (0, 1]",
                self.max_delta_ratio
            ));
        }
        if self.max_chain_len == 0 {
            return fail("max_chain_len must be at least 1".into());
        }
        if self.scheduler_tick_secs == 0 {
            return fail("scheduler_tick_secs must be at least 1".into());
        }
        Ok(())
    }

    /// Whether a delta of `delta_len` bytes is worth keeping for a `target_len`-byte file.
    pub fn prefer_delta(&self, delta_len: usize, target_len: u64) -> bool {
        if target_len < self.small_file_threshold {
            return true;
        }
        (delta_len as f64) <= self.max_delta_ratio * target_len as f64
    }
}
