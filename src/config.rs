//! # Ledger Configuration
//!
//! Settings for the placement ledger and the task contexts it runs on, stored as JSON.
//! Missing fields take their defaults, so an empty object `{}` is a valid config.
//!
//! ```json
//! {
//!   "debug": false,
//!   "storage_dir": "region_blocks",
//!   "max_entries": 10000,
//!   "idle_timeout_secs": 300,
//!   "sweep_interval_secs": 60,
//!   "load_context": "RegionBlock-IO",
//!   "save_context": "RegionBlock",
//!   "maintenance_context": "RegionBlock-Maintenance",
//!   "tasks": { "workers": 1, "queue_capacity": 4096, "shutdown_grace_millis": 5000 }
//! }
//! ```

use crate::task_management::TaskContextSettings;
use anyhow::Context;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use web_time::Duration;

/// Configuration of a [`PlacementLedger`](crate::ledger::PlacementLedger).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Logs every placement at `info` level.
    pub debug: bool,
    /// Directory, relative to the ledger's base directory, holding the ledger files.
    pub storage_dir: String,
    /// Maximum number of chunk ledgers kept in memory.
    pub max_entries: usize,
    /// Seconds without access after which a cached ledger is evicted.
    pub idle_timeout_secs: u64,
    /// Seconds between sweeps for idle ledgers.
    pub sweep_interval_secs: u64,
    /// Task context that loads ledgers from disk.
    pub load_context: String,
    /// Task context that saves evicted ledgers.
    pub save_context: String,
    /// Task context running the idle sweep.
    pub maintenance_context: String,
    /// Sizing shared by every task context.
    pub tasks: TaskContextSettings,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            storage_dir: "region_blocks".to_string(),
            max_entries: 10_000,
            idle_timeout_secs: 5 * 60,
            sweep_interval_secs: 60,
            load_context: "RegionBlock-IO".to_string(),
            save_context: "RegionBlock".to_string(),
            maintenance_context: "RegionBlock-Maintenance".to_string(),
            tasks: TaskContextSettings::default(),
        }
    }
}

impl LedgerConfig {
    /// Reads the config at `path`, falling back to defaults when it is missing or
    /// unreadable, then writes the effective config back so new fields show up on disk.
    ///
    /// Never fails; problems are logged.
    pub fn load_or_default(path: &Path) -> Self {
        let config = if path.exists() {
            match Self::read(path) {
                Ok(config) => config,
                Err(read_error) => {
                    error!("Using default config: {:#}", read_error);
                    Self::default()
                }
            }
        } else {
            info!("No config at {}; writing defaults", path.display());
            Self::default()
        };

        if let Err(write_error) = config.write(path) {
            error!("Failed to write config: {:#}", write_error);
        }
        config
    }

    /// Parses the config at `path`.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Writes the config to `path` as pretty-printed JSON, creating parent directories.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))
    }

    /// Idle expiry of cached ledgers.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Interval between idle sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
