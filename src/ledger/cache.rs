//! # Region Cache
//!
//! Bounded, access-expiring map from [`CacheKey`] to live [`RegionLedger`]s.
//!
//! ## Access Path
//! 1. A hit on a fresh entry refreshes its access time and returns the shared ledger
//! 2. A miss installs an empty ledger under the map lock (so concurrent first lookups
//!    agree on one instance), returns it at once, and queues a background load that
//!    merges the persisted positions into that same instance
//!
//! Until the background load lands, lookups on a cold ledger can miss positions that
//! exist on disk. Callers that must not act on such a false negative have no way to
//! wait for the load; the window is accepted.
//!
//! ## Eviction
//! Entries leave the cache through capacity pressure (least recently used first), idle
//! expiry, explicit invalidation or shutdown. Every path except shutdown parks a dirty
//! ledger in a pending-save map and hands it to the save context; shutdown saves on the
//! calling thread. While parked, the ledger is still the one instance for its key: a
//! lookup takes it back rather than loading a second copy from a file that is about to
//! be rewritten. A save never runs before the ledger's persisted positions are merged
//! in, so a partial set cannot replace the file. A save that fails after eviction loses
//! the ledger's unsaved changes.

use super::persistence::{LedgerStore, SaveOutcome};
use super::position::CacheKey;
use super::region::RegionLedger;
use crate::task_management::AsyncTaskContext;
use dashmap::DashMap;
use log::{debug, info};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use web_time::{Duration, Instant};

struct CacheEntry {
    ledger: Arc<RegionLedger>,
    last_access: Instant,
}

/// An evicted dirty ledger whose background save has not finished yet.
struct PendingSave {
    ticket: u64,
    ledger: Arc<RegionLedger>,
}

/// The cache of live ledgers and the I/O contexts feeding it.
pub struct RegionCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    pending_saves: Arc<DashMap<CacheKey, PendingSave>>,
    next_ticket: AtomicU64,
    idle_timeout: Duration,
    store: Arc<dyn LedgerStore>,
    load_context: Arc<AsyncTaskContext>,
    save_context: Arc<AsyncTaskContext>,
}

impl RegionCache {
    /// Creates an empty cache holding at most `max_entries` ledgers (at least one), each
    /// expiring after `idle_timeout` without access.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        load_context: Arc<AsyncTaskContext>,
        save_context: Arc<AsyncTaskContext>,
        max_entries: usize,
        idle_timeout: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            pending_saves: Arc::new(DashMap::new()),
            next_ticket: AtomicU64::new(0),
            idle_timeout,
            store,
            load_context,
            save_context,
        }
    }

    /// Returns the live ledger for `key`, creating it and queueing its load on a miss.
    ///
    /// A ledger evicted with unsaved changes stays the live instance for its key until
    /// its save finishes; a lookup in that window gets it back instead of a fresh copy.
    ///
    /// Never blocks on disk I/O unless the load context has degraded to running work
    /// inline.
    pub fn get(&self, key: &CacheKey) -> Arc<RegionLedger> {
        let now = Instant::now();
        let (ledger, needs_load, retired) = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(key) {
                if now.duration_since(entry.last_access) < self.idle_timeout {
                    entry.last_access = now;
                    return entry.ledger.clone();
                }
            }

            // Either absent or idle past its timeout.
            let mut retired = Vec::new();
            if let Some(stale) = entries.pop(key) {
                debug!("{} expired", key);
                retired.extend(self.retire(key.clone(), stale.ledger));
            }

            let (ledger, needs_load) = match self.pending_saves.remove(key) {
                Some((_, pending)) => {
                    debug!("{} revived while its save is pending", key);
                    (pending.ledger, false)
                }
                None => (Arc::new(RegionLedger::new()), true),
            };

            let evicted = entries.push(
                key.clone(),
                CacheEntry {
                    ledger: ledger.clone(),
                    last_access: now,
                },
            );
            if let Some((evicted_key, entry)) = evicted {
                debug!("Evicted {} to make room for {}", evicted_key, key);
                retired.extend(self.retire(evicted_key, entry.ledger));
            }
            (ledger, needs_load, retired)
        };

        self.queue_saves(retired);

        if needs_load {
            let store = self.store.clone();
            let target = ledger.clone();
            let load_key = key.clone();
            self.load_context.run_async(move || load_into(store.as_ref(), &load_key, &target));
        }

        ledger
    }

    /// Removes `key`, flushing its ledger in the background if dirty. Returns whether an
    /// entry was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let retired = {
            let mut entries = self.entries.lock();
            match entries.pop(key) {
                Some(entry) => self.retire(key.clone(), entry.ledger),
                None => return false,
            }
        };
        self.queue_saves(retired.into_iter().collect());
        true
    }

    /// Removes every entry, flushing dirty ledgers in the background.
    pub fn invalidate_all(&self) {
        let retired: Vec<_> = {
            let mut entries = self.entries.lock();
            std::iter::from_fn(|| entries.pop_lru())
                .filter_map(|(key, entry)| self.retire(key, entry.ledger))
                .collect()
        };
        self.queue_saves(retired);
    }

    /// Removes entries idle for longer than the timeout and returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let (count, retired) = {
            let mut entries = self.entries.lock();
            let stale_keys: Vec<CacheKey> = entries
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_access) >= self.idle_timeout)
                .map(|(key, _)| key.clone())
                .collect();
            let count = stale_keys.len();
            let retired: Vec<_> = stale_keys
                .into_iter()
                .filter_map(|key| {
                    let entry = entries.pop(&key)?;
                    self.retire(key, entry.ledger)
                })
                .collect();
            (count, retired)
        };

        self.queue_saves(retired);
        if count > 0 {
            debug!("Evicted {} idle ledger(s)", count);
        }
        count
    }

    /// Number of live ledgers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no ledger is live.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Empties the cache and saves every dirty ledger on the calling thread, including
    /// evicted ones whose background save has not run yet.
    ///
    /// Returns once every save has finished, with the number of ledgers written.
    pub fn shutdown(&self) -> usize {
        let mut drained: Vec<_> = {
            let mut entries = self.entries.lock();
            std::iter::from_fn(|| entries.pop_lru())
                .map(|(key, entry)| (key, entry.ledger))
                .collect()
        };
        let pending: Vec<CacheKey> = self.pending_saves.iter().map(|e| e.key().clone()).collect();
        drained.extend(
            pending
                .into_iter()
                .filter_map(|key| self.pending_saves.remove(&key))
                .map(|(key, pending)| (key, pending.ledger)),
        );

        let total = drained.len();
        let written = drained
            .into_iter()
            .filter(|(key, ledger)| save_loaded(self.store.as_ref(), key, ledger))
            .count();
        info!("Flushed {} of {} cached ledger(s)", written, total);
        written
    }

    /// Parks a ledger leaving the cache in the pending-save map if it is dirty. Called
    /// with the entry lock held, so no lookup can miss both maps in between.
    fn retire(&self, key: CacheKey, ledger: Arc<RegionLedger>) -> Option<(CacheKey, u64)> {
        if !ledger.is_dirty() {
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.pending_saves
            .insert(key.clone(), PendingSave { ticket, ledger });
        Some((key, ticket))
    }

    fn queue_saves(&self, retired: Vec<(CacheKey, u64)>) {
        for (key, ticket) in retired {
            let store = self.store.clone();
            let pending_saves = self.pending_saves.clone();
            self.save_context.run_async(move || {
                let ledger = match pending_saves.get(&key) {
                    Some(pending) if pending.ticket == ticket => pending.ledger.clone(),
                    // Revived, or superseded by a later eviction with its own save.
                    _ => return,
                };
                save_loaded(store.as_ref(), &key, &ledger);
                pending_saves.remove_if(&key, |_, pending| pending.ticket == ticket);
            });
        }
    }
}

fn load_into(store: &dyn LedgerStore, key: &CacheKey, target: &RegionLedger) {
    if target.is_loaded() {
        return;
    }
    let loaded = store.load(key);
    target.merge_from(&loaded);
    target.mark_loaded();
}

/// Saves `ledger`, first merging the persisted positions if its own load has not landed,
/// so a partial set never replaces the file.
fn save_loaded(store: &dyn LedgerStore, key: &CacheKey, ledger: &RegionLedger) -> bool {
    if !ledger.is_dirty() {
        return false;
    }
    load_into(store, key, ledger);
    store.save(key, ledger) == SaveOutcome::Written
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::position::{pack, PackedPosition};
    use crate::task_management::TaskContextSettings;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// In-memory store that records every load and save, optionally holding loads or
    /// saves until released.
    #[derive(Default)]
    struct RecordingStore {
        persisted: Mutex<HashMap<CacheKey, Vec<PackedPosition>>>,
        loads: AtomicUsize,
        saves: Mutex<Vec<CacheKey>>,
        load_gate: Option<Receiver<()>>,
        save_gate: Option<Receiver<()>>,
    }

    impl RecordingStore {
        fn gated() -> (Self, Sender<()>) {
            let (release, gate) = unbounded();
            let store = Self {
                load_gate: Some(gate),
                ..Self::default()
            };
            (store, release)
        }

        fn persist(&self, key: &CacheKey, positions: &[PackedPosition]) {
            self.persisted.lock().insert(key.clone(), positions.to_vec());
        }

        fn saved(&self) -> Vec<CacheKey> {
            self.saves.lock().clone()
        }
    }

    impl LedgerStore for RecordingStore {
        fn load(&self, key: &CacheKey) -> RegionLedger {
            if let Some(gate) = &self.load_gate {
                let _ = gate.recv();
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.persisted
                .lock()
                .get(key)
                .map(|positions| positions.iter().copied().collect())
                .unwrap_or_default()
        }

        fn save(&self, key: &CacheKey, ledger: &RegionLedger) -> SaveOutcome {
            if let Some(gate) = &self.save_gate {
                let _ = gate.recv();
            }
            if !ledger.take_dirty() {
                return SaveOutcome::Clean;
            }
            self.persist(key, &ledger.snapshot());
            self.saves.lock().push(key.clone());
            SaveOutcome::Written
        }
    }

    struct Fixture {
        cache: RegionCache,
        store: Arc<RecordingStore>,
        load_context: Arc<AsyncTaskContext>,
        save_context: Arc<AsyncTaskContext>,
    }

    impl Fixture {
        fn new(store: RecordingStore, max_entries: usize, idle_timeout: Duration) -> Self {
            let store = Arc::new(store);
            let load_context = Arc::new(AsyncTaskContext::new(
                "Test-Load",
                TaskContextSettings::default(),
            ));
            let save_context = Arc::new(AsyncTaskContext::new(
                "Test-Save",
                TaskContextSettings::default(),
            ));
            let cache = RegionCache::new(
                store.clone(),
                load_context.clone(),
                save_context.clone(),
                max_entries,
                idle_timeout,
            );
            Self {
                cache,
                store,
                load_context,
                save_context,
            }
        }

        fn with_defaults(store: RecordingStore) -> Self {
            Self::new(store, 10_000, Duration::from_secs(300))
        }

        /// Drains both contexts so every queued load and save has finished.
        fn settle(&self) {
            self.load_context.shutdown();
            self.save_context.shutdown();
        }
    }

    fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn key(x: i32) -> CacheKey {
        CacheKey::new("overworld", x, 0)
    }

    #[test]
    fn additions_are_visible_immediately() {
        let fixture = Fixture::with_defaults(RecordingStore::default());

        assert!(fixture.cache.get(&key(0)).add(pack(1, 64, 1)));
        assert!(fixture.cache.get(&key(0)).contains(pack(1, 64, 1)));
        assert!(!fixture.cache.get(&key(1)).contains(pack(1, 64, 1)));
        fixture.settle();
    }

    #[test]
    fn cold_miss_reports_absent_until_the_load_lands() {
        let (store, release) = RecordingStore::gated();
        store.persist(&key(0), &[pack(2, 70, 2)]);
        let fixture = Fixture::with_defaults(store);

        let ledger = fixture.cache.get(&key(0));
        assert!(!ledger.contains(pack(2, 70, 2)));

        release.send(()).unwrap();
        assert!(eventually(|| fixture.cache.get(&key(0)).contains(pack(2, 70, 2))));
        // Merging persisted data into an empty ledger counts as a change.
        assert!(ledger.is_dirty());
        fixture.settle();
    }

    #[test]
    fn removal_before_the_load_is_undone_by_the_merge() {
        let (store, release) = RecordingStore::gated();
        store.persist(&key(0), &[pack(3, 3, 3)]);
        let fixture = Fixture::with_defaults(store);

        assert!(!fixture.cache.get(&key(0)).remove(pack(3, 3, 3)));
        release.send(()).unwrap();

        assert!(eventually(|| fixture.cache.get(&key(0)).contains(pack(3, 3, 3))));
        fixture.settle();
    }

    #[test]
    fn concurrent_first_access_creates_one_ledger_and_one_load() {
        let fixture = Arc::new(Fixture::with_defaults(RecordingStore::default()));

        let lookups: Vec<_> = (0..8)
            .map(|_| {
                let fixture = fixture.clone();
                thread::spawn(move || fixture.cache.get(&key(9)))
            })
            .collect();
        let ledgers: Vec<_> = lookups.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ledgers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        fixture.settle();
        assert_eq!(fixture.store.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capacity_eviction_flushes_dirty_ledgers_once_and_clean_ones_never() {
        let fixture = Fixture::new(RecordingStore::default(), 2, Duration::from_secs(300));

        fixture.cache.get(&key(0)).add(pack(0, 1, 0));
        fixture.cache.get(&key(1));
        // Evicts key 0 (dirty), then key 1 (clean).
        fixture.cache.get(&key(2));
        fixture.cache.get(&key(3));
        assert_eq!(fixture.cache.len(), 2);

        fixture.settle();
        assert_eq!(fixture.store.saved(), vec![key(0)]);
        assert_eq!(fixture.store.persisted.lock()[&key(0)], vec![pack(0, 1, 0)]);
    }

    #[test]
    fn idle_entries_expire_on_sweep_and_on_access() {
        let fixture = Fixture::new(RecordingStore::default(), 100, Duration::from_millis(20));

        fixture.cache.get(&key(0)).add(pack(1, 1, 1));
        fixture.cache.get(&key(1));
        let dirty = fixture.cache.get(&key(2));
        dirty.add(pack(2, 2, 2));
        let clean = fixture.cache.get(&key(3));
        thread::sleep(Duration::from_millis(40));

        // An expired ledger with unsaved changes stays the live instance; a clean one
        // is replaced and reloaded.
        assert!(Arc::ptr_eq(&dirty, &fixture.cache.get(&key(2))));
        assert!(!Arc::ptr_eq(&clean, &fixture.cache.get(&key(3))));

        // Keys 0 and 1 are idle; keys 2 and 3 were just touched.
        assert_eq!(fixture.cache.evict_expired(), 2);
        assert_eq!(fixture.cache.len(), 2);

        fixture.settle();
        assert_eq!(fixture.store.saved(), vec![key(0)]);
    }

    #[test]
    fn lookup_during_a_pending_save_revives_the_evicted_ledger() {
        let (release, gate) = unbounded();
        let store = RecordingStore {
            save_gate: Some(gate),
            ..RecordingStore::default()
        };
        store.persist(&key(0), &[pack(1, 1, 1)]);
        let fixture = Fixture::new(store, 100, Duration::from_millis(20));

        let original = fixture.cache.get(&key(0));
        assert!(eventually(|| original.is_loaded()));
        original.add(pack(2, 2, 2));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(fixture.cache.evict_expired(), 1);

        let revived = fixture.cache.get(&key(0));
        assert!(Arc::ptr_eq(&original, &revived));
        revived.add(pack(3, 3, 3));

        drop(release);
        fixture.settle();
        fixture.cache.shutdown();

        let on_disk: HashSet<_> = fixture.store.persisted.lock()[&key(0)]
            .iter()
            .copied()
            .collect();
        assert_eq!(on_disk, HashSet::from([pack(1, 1, 1), pack(2, 2, 2), pack(3, 3, 3)]));
        assert_eq!(fixture.store.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eviction_before_the_load_lands_keeps_persisted_positions() {
        let (store, release) = RecordingStore::gated();
        store.persist(&key(0), &[pack(1, 1, 1)]);
        let fixture = Fixture::with_defaults(store);

        fixture.cache.get(&key(0)).add(pack(2, 2, 2));
        assert!(fixture.cache.invalidate(&key(0)));

        drop(release);
        fixture.settle();

        let on_disk: HashSet<_> = fixture.store.persisted.lock()[&key(0)]
            .iter()
            .copied()
            .collect();
        assert_eq!(on_disk, HashSet::from([pack(1, 1, 1), pack(2, 2, 2)]));
    }

    #[test]
    fn invalidate_flushes_dirty_ledgers() {
        let fixture = Fixture::with_defaults(RecordingStore::default());

        fixture.cache.get(&key(0)).add(pack(4, 4, 4));
        fixture.cache.get(&key(1)).add(pack(5, 5, 5));
        fixture.cache.get(&key(2));

        assert!(fixture.cache.invalidate(&key(0)));
        assert!(!fixture.cache.invalidate(&key(0)));
        fixture.cache.invalidate_all();
        assert!(fixture.cache.is_empty());

        fixture.settle();
        let mut saved = fixture.store.saved();
        saved.sort_by_key(|key| key.chunk_x);
        assert_eq!(saved, vec![key(0), key(1)]);
    }

    #[test]
    fn shutdown_saves_every_dirty_ledger_before_returning() {
        let fixture = Fixture::with_defaults(RecordingStore::default());
        // Let the empty loads finish so they cannot race the flush.
        for x in 0..25 {
            fixture.cache.get(&key(x));
        }
        assert!(eventually(|| fixture.store.loads.load(Ordering::SeqCst) == 25));

        for x in 0..25 {
            fixture.cache.get(&key(x)).add(pack(x, 10, x));
        }
        fixture.cache.get(&key(99));

        assert_eq!(fixture.cache.shutdown(), 25);
        assert_eq!(fixture.store.saved().len(), 25);
        assert!(fixture.cache.is_empty());
        fixture.settle();
    }
}
