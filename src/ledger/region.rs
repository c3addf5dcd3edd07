//! # Region Ledger
//!
//! The in-memory set of player-placed block positions for one chunk, plus a dirty flag
//! tracking unsaved changes.
//!
//! ## Thread Safety
//!
//! A ledger is shared, without an outer lock, between the game-logic thread that
//! mutates it and the background threads that load into it and save it. Membership
//! lives in a sharded concurrent set and the dirty flag is an atomic, so every
//! operation takes `&self`.

use super::position::PackedPosition;
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Player-placed block positions of one chunk.
///
/// # Examples
/// ```
/// use placement_ledger::ledger::RegionLedger;
///
/// let ledger = RegionLedger::new();
/// assert!(ledger.add(42));
/// assert!(!ledger.add(42));
/// assert!(ledger.is_dirty());
///
/// ledger.clear_dirty();
/// assert!(ledger.contains(42));
/// assert!(!ledger.is_dirty());
/// ```
#[derive(Debug, Default)]
pub struct RegionLedger {
    blocks: DashSet<PackedPosition>,
    dirty: AtomicBool,
    loaded: AtomicBool,
}

impl RegionLedger {
    /// Creates an empty, clean ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `key`. Returns `true` and marks the ledger dirty if it was not present.
    pub fn add(&self, key: PackedPosition) -> bool {
        let added = self.blocks.insert(key);
        if added {
            self.mark_dirty();
        }
        added
    }

    /// Removes `key`. Returns `true` and marks the ledger dirty if it was present.
    pub fn remove(&self, key: PackedPosition) -> bool {
        let removed = self.blocks.remove(&key).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Membership test. Never touches the dirty flag.
    pub fn contains(&self, key: PackedPosition) -> bool {
        self.blocks.contains(&key)
    }

    /// Unions `other` into this ledger; marks dirty only if something was added.
    ///
    /// The union knows nothing about removals made here after `other` was read, so a
    /// position removed in the meantime comes back.
    pub fn merge_from(&self, other: &RegionLedger) {
        let mut changed = false;
        for key in other.blocks.iter() {
            changed |= self.blocks.insert(*key);
        }
        if changed {
            self.mark_dirty();
        }
    }

    /// Whether there are changes not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Flags the ledger as having unsaved changes.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears the dirty flag; reserved for the persistence path.
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Clears the dirty flag and reports whether it was set, in one step.
    ///
    /// Writers call this before taking their [`snapshot`](Self::snapshot) and
    /// [`mark_dirty`](Self::mark_dirty) again if the write fails, so changes made while
    /// the write is in flight are never marked clean.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Records that the persisted positions have been merged in.
    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Whether the persisted positions have been merged in. A ledger that is not
    /// loaded must not be written over its file.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Number of positions in the ledger.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the ledger holds no positions.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// A point-in-time copy of the stored positions, in no particular order.
    pub fn snapshot(&self) -> Vec<PackedPosition> {
        self.blocks.iter().map(|key| *key).collect()
    }
}

impl FromIterator<PackedPosition> for RegionLedger {
    /// Builds a clean ledger from positions, as a freshly loaded ledger would be.
    fn from_iter<I: IntoIterator<Item = PackedPosition>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
            dirty: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
        }
    }
}
