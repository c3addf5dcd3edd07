//! # Ledger Persistence
//!
//! Reads and writes one gzip-compressed file per chunk:
//!
//! ```text
//! <root>/<world>/region_<chunk x>_<chunk z>.dat
//!
//! gzip(
//!     count:    i32 big-endian
//!     position: i64 big-endian   (repeated count times)
//! )
//! ```
//!
//! Files are rewritten in place; a crash mid-write can leave a truncated file, which
//! then loads as empty.

use super::position::{CacheKey, PackedPosition};
use super::region::RegionLedger;
use anyhow::{ensure, Context};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, error};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Upper bound on entries preallocated from an untrusted count.
const MAX_PREALLOCATED_ENTRIES: usize = 1 << 16;

/// What a save attempt did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The ledger had no unsaved changes; nothing was written.
    Clean,
    /// The ledger was written and marked clean.
    Written,
    /// The write failed; the ledger stays dirty.
    Failed,
}

/// Where the cache loads ledgers from and flushes them to.
///
/// Implementations swallow their own errors: a failed load yields an empty ledger, a
/// failed save reports [`SaveOutcome::Failed`] and leaves the ledger dirty.
pub trait LedgerStore: Send + Sync {
    /// Loads the persisted ledger for `key`, clean.
    fn load(&self, key: &CacheKey) -> RegionLedger;

    /// Persists `ledger` if it is dirty.
    fn save(&self, key: &CacheKey, ledger: &RegionLedger) -> SaveOutcome;
}

/// File-backed [`LedgerStore`] rooted at the ledger storage directory.
#[derive(Clone, Debug)]
pub struct PersistenceStore {
    root: PathBuf,
}

impl PersistenceStore {
    /// Creates a store rooted at `root`. Nothing is touched on disk until the first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `key`'s ledger.
    pub fn region_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.world).join(key.file_name())
    }

    /// Reads `key`'s ledger from disk. A missing file is an empty ledger, not an error.
    pub fn read_region(&self, key: &CacheKey) -> anyhow::Result<RegionLedger> {
        let path = self.region_path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(open_error) if open_error.kind() == io::ErrorKind::NotFound => {
                return Ok(RegionLedger::new());
            }
            Err(open_error) => {
                return Err(open_error).with_context(|| format!("opening {}", path.display()));
            }
        };

        let mut reader = GzDecoder::new(BufReader::new(file));
        let count = read_i32(&mut reader)
            .with_context(|| format!("reading count from {}", path.display()))?;
        ensure!(count >= 0, "{} has a negative entry count ({})", path.display(), count);

        let count = count as usize;
        let mut positions = Vec::with_capacity(count.min(MAX_PREALLOCATED_ENTRIES));
        for index in 0..count {
            let position = read_i64(&mut reader).with_context(|| {
                format!("reading entry {} of {} from {}", index, count, path.display())
            })?;
            positions.push(position);
        }

        Ok(positions.into_iter().collect())
    }

    /// Writes `positions` as `key`'s ledger, creating the world directory if needed.
    pub fn write_region(&self, key: &CacheKey, positions: &[PackedPosition]) -> anyhow::Result<()> {
        let path = self.region_path(key);
        if let Some(world_dir) = path.parent() {
            fs::create_dir_all(world_dir)
                .with_context(|| format!("creating {}", world_dir.display()))?;
        }

        let count = i32::try_from(positions.len())
            .with_context(|| format!("{} holds too many positions to store", key))?;

        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        encoder.write_all(&count.to_be_bytes())?;
        for position in positions {
            encoder.write_all(&position.to_be_bytes())?;
        }
        encoder
            .finish()
            .and_then(|mut writer| writer.flush())
            .with_context(|| format!("finishing {}", path.display()))?;

        Ok(())
    }
}

impl LedgerStore for PersistenceStore {
    fn load(&self, key: &CacheKey) -> RegionLedger {
        match self.read_region(key) {
            Ok(ledger) => {
                debug!("Loaded {} position(s) for {}", ledger.len(), key);
                ledger
            }
            Err(load_error) => {
                error!("Failed to load placed blocks for {}: {:#}", key, load_error);
                RegionLedger::new()
            }
        }
    }

    fn save(&self, key: &CacheKey, ledger: &RegionLedger) -> SaveOutcome {
        // Cleared before the snapshot so changes racing with the write re-dirty it.
        if !ledger.take_dirty() {
            return SaveOutcome::Clean;
        }

        let positions = ledger.snapshot();
        match self.write_region(key, &positions) {
            Ok(()) => {
                debug!("Saved {} position(s) for {}", positions.len(), key);
                SaveOutcome::Written
            }
            Err(save_error) => {
                ledger.mark_dirty();
                error!("Failed to save placed blocks for {}: {:#}", key, save_error);
                SaveOutcome::Failed
            }
        }
    }
}

fn read_i32(reader: &mut impl Read) -> io::Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_be_bytes(bytes))
}

fn read_i64(reader: &mut impl Read) -> io::Result<i64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(i64::from_be_bytes(bytes))
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
