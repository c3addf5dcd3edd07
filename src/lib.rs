#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Placement Ledger
//!
//! Tracks which blocks in a voxel world were placed by players, so that gameplay code
//! (drops, rewards, anti-farming checks) can tell them apart from generated terrain.
//!
//! The ledger keeps one set of packed block positions per chunk, caches the sets of
//! recently used chunks in memory, and persists them as small gzip files. All disk I/O
//! runs on named background task contexts so event handlers never wait for the disk.
//!
//! ## Key Modules
//!
//! * `ledger` - The placement ledger: position packing, per-chunk sets, cache and files
//! * `task_management` - Named worker-pool contexts with delayed and periodic scheduling
//! * `config` - JSON configuration for the ledger and its task contexts
//! * `core` - Shared-state wrappers used across the crate
//!
//! ## Architecture
//!
//! The crate follows a modular architecture with clear separation between:
//! * Execution (task contexts and their registry, owned by the host)
//! * Caching (bounded, idle-expiring, single creation per chunk)
//! * Storage (one file per chunk behind a store trait)
//!
//! ## Usage
//!
//! ```rust
//! use cgmath::{Point2, Point3};
//! use placement_ledger::config::LedgerConfig;
//! use placement_ledger::ledger::PlacementLedger;
//! use placement_ledger::task_management::TaskContextRegistry;
//! use std::sync::Arc;
//!
//! placement_ledger::init_logger();
//!
//! let base_dir = std::env::temp_dir().join(format!("ledger-usage-{}", std::process::id()));
//! let config = LedgerConfig::load_or_default(&base_dir.join("config.json"));
//! let registry = Arc::new(TaskContextRegistry::new(config.tasks.clone()));
//! let ledger = PlacementLedger::init(&base_dir, config, registry).unwrap();
//!
//! let already_placed = !ledger.mark_placed("overworld", Point2::new(0, 0), Point3::new(1, 70, 2));
//! assert!(!already_placed);
//!
//! ledger.shutdown();
//! # let _ = std::fs::remove_dir_all(&base_dir);
//! ```
//!
//! ## Performance Considerations
//!
//! * Lookups on cached chunks take one short map lock and a sharded set lookup
//! * Cold chunks are answered immediately from an empty set while they load
//! * Saves only happen for chunks with unsaved changes

use log::info;

pub mod config;
pub mod core;
pub mod ledger;
pub mod task_management;

pub use config::LedgerConfig;
pub use ledger::PlacementLedger;
pub use task_management::{AsyncTaskContext, TaskContextRegistry, TaskHandle};

/// Installs the stdout logger, filtered by `RUST_LOG`.
///
/// Safe to call more than once; only the first call installs a logger.
pub fn init_logger() {
    let mut log_builder = env_logger::Builder::new();
    let installed = log_builder
        .target(env_logger::Target::Stdout)
        .parse_env("RUST_LOG")
        .try_init();

    if installed.is_ok() {
        info!("Logger initialized");
    }
}
