//! # Placement Ledger
//!
//! Records which block positions were placed by players, so a break handler can tell a
//! player-placed block from a naturally generated one.
//!
//! ## Architecture Overview
//!
//! - `position`: packs block coordinates into one `i64` and names chunk ledgers
//! - `region`: the per-chunk concurrent set plus its dirty flag
//! - `persistence`: gzip file per chunk, behind the `LedgerStore` trait
//! - `cache`: bounded, idle-expiring map of live ledgers with background load and save
//! - `PlacementLedger`: the facade used by event handlers, owning the cache and the
//!   periodic idle sweep
//!
//! ## Consistency
//!
//! Lookups never wait for disk. The first lookup of a chunk answers from an empty
//! ledger while the persisted positions load in the background, so `is_placed` can
//! briefly report `false` for a block placed in an earlier session. Removing a position
//! during that window does not stick: the load merges it back.
//!
//! ## Example Usage
//! ```rust
//! use cgmath::{Point2, Point3};
//! use placement_ledger::config::LedgerConfig;
//! use placement_ledger::ledger::PlacementLedger;
//! use placement_ledger::task_management::TaskContextRegistry;
//! use std::sync::Arc;
//!
//! let base_dir = std::env::temp_dir().join(format!("ledger-doc-{}", std::process::id()));
//! let config = LedgerConfig::default();
//! let registry = Arc::new(TaskContextRegistry::new(config.tasks.clone()));
//! let ledger = PlacementLedger::init(&base_dir, config, registry).unwrap();
//!
//! let chunk = Point2::new(0, 0);
//! let block = Point3::new(3, 64, 7);
//! assert!(ledger.mark_placed("overworld", chunk, block));
//! assert!(ledger.is_placed("overworld", chunk, block));
//! assert!(ledger.remove_placed("overworld", chunk, block));
//!
//! ledger.shutdown();
//! # let _ = std::fs::remove_dir_all(&base_dir);
//! ```

pub mod cache;
pub mod persistence;
pub mod position;
pub mod region;

pub use cache::RegionCache;
pub use persistence::{LedgerStore, PersistenceStore, SaveOutcome};
pub use position::{pack, pack_point, CacheKey, PackedPosition};
pub use region::RegionLedger;

use crate::config::LedgerConfig;
use crate::task_management::{AsyncTaskContext, TaskContextRegistry};
use anyhow::Context;
use cgmath::{Point2, Point3};
use log::{info, warn};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Player-placed block ledger for every world, backed by per-chunk files.
pub struct PlacementLedger {
    cache: Arc<RegionCache>,
    load_context: Arc<AsyncTaskContext>,
    save_context: Arc<AsyncTaskContext>,
    maintenance_context: Arc<AsyncTaskContext>,
    debug: bool,
}

impl PlacementLedger {
    /// Opens the ledger stored under `base_dir/<storage_dir>`, creating the directory.
    ///
    /// Task contexts are taken from `registry` by the names in `config`, and the idle
    /// sweep is scheduled on the maintenance context.
    pub fn init(
        base_dir: &Path,
        config: LedgerConfig,
        registry: Arc<TaskContextRegistry>,
    ) -> anyhow::Result<Self> {
        let storage_dir = base_dir.join(&config.storage_dir);
        fs::create_dir_all(&storage_dir)
            .with_context(|| format!("creating ledger storage at {}", storage_dir.display()))?;
        info!("Placement ledger storing under {}", storage_dir.display());

        Ok(Self::with_store(
            Arc::new(PersistenceStore::new(storage_dir)),
            config,
            registry,
        ))
    }

    /// Builds a ledger over an arbitrary store.
    pub fn with_store(
        store: Arc<dyn LedgerStore>,
        config: LedgerConfig,
        registry: Arc<TaskContextRegistry>,
    ) -> Self {
        let load_context = registry.get_or_create(&config.load_context);
        let save_context = registry.get_or_create(&config.save_context);
        let maintenance_context = registry.get_or_create(&config.maintenance_context);
        let cache = Arc::new(RegionCache::new(
            store,
            load_context.clone(),
            save_context.clone(),
            config.max_entries,
            config.idle_timeout(),
        ));

        let sweep_interval = config.sweep_interval();
        if sweep_interval.is_zero() {
            warn!("Idle sweep disabled; idle ledgers are only evicted when accessed");
        } else {
            let sweep_target = Arc::downgrade(&cache);
            maintenance_context.schedule_at_fixed_rate(
                move || Ok(sweep_target.upgrade().map_or(0, |cache| cache.evict_expired())),
                sweep_interval,
                sweep_interval,
            );
        }

        Self {
            cache,
            load_context,
            save_context,
            maintenance_context,
            debug: config.debug,
        }
    }

    /// Records `position` in `world` as player-placed. Returns `true` if it was not
    /// already recorded.
    pub fn mark_placed(&self, world: &str, chunk: Point2<i32>, position: Point3<i32>) -> bool {
        let newly_placed = self.ledger(world, chunk).add(pack_point(position));
        if self.debug {
            info!(
                "Block placed at {:?} in {}. Already placed: {}",
                position, world, !newly_placed
            );
        }
        newly_placed
    }

    /// Forgets `position`. Returns whether it was recorded, in the same step.
    pub fn remove_placed(&self, world: &str, chunk: Point2<i32>, position: Point3<i32>) -> bool {
        let removed = self.ledger(world, chunk).remove(pack_point(position));
        if self.debug {
            info!("Block removed at {:?} in {}. Was placed: {}", position, world, removed);
        }
        removed
    }

    /// Whether `position` is recorded as player-placed.
    pub fn is_placed(&self, world: &str, chunk: Point2<i32>, position: Point3<i32>) -> bool {
        self.ledger(world, chunk).contains(pack_point(position))
    }

    /// The underlying cache.
    pub fn cache(&self) -> &RegionCache {
        &self.cache
    }

    /// Stops the sweep, lets queued loads and saves finish on the ledger's own task
    /// contexts, then writes every dirty cached ledger before returning.
    ///
    /// Other contexts of the registry keep running; tearing the registry down is the
    /// host's job. The ledger's contexts stay registered in their stopped state, so a
    /// later ledger built on the same registry runs its I/O inline.
    pub fn shutdown(&self) {
        self.maintenance_context.shutdown();
        self.load_context.shutdown();
        self.save_context.shutdown();
        let written = self.cache.shutdown();
        info!("Placement ledger shut down; {} ledger(s) written", written);
    }

    fn ledger(&self, world: &str, chunk: Point2<i32>) -> Arc<RegionLedger> {
        self.cache.get(&CacheKey::new(world, chunk.x, chunk.y))
    }
}
