use cgmath::{Point2, Point3};
use flate2::read::GzDecoder;
use placement_ledger::config::LedgerConfig;
use placement_ledger::ledger::{pack, PlacementLedger};
use placement_ledger::task_management::{TaskContextRegistry, TaskContextSettings};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn unique_base_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "placement-ledger-it-{}-{}-{}",
        label,
        std::process::id(),
        nanos
    ))
}

fn open(base_dir: &Path, config: &LedgerConfig) -> PlacementLedger {
    let registry = Arc::new(TaskContextRegistry::new(TaskContextSettings {
        shutdown_grace_millis: 2_000,
        ..config.tasks.clone()
    }));
    PlacementLedger::init(base_dir, config.clone(), registry).unwrap()
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

#[test]
fn placements_survive_a_restart() {
    placement_ledger::init_logger();
    let base_dir = unique_base_dir("restart");
    let config = LedgerConfig::default();

    let blocks: Vec<_> = (0..50)
        .map(|i| {
            let position = Point3::new(fastrand::i32(0..16), fastrand::i32(0..256), i);
            (Point2::new(i % 3, 0), position)
        })
        .collect();

    let first = open(&base_dir, &config);
    for (chunk, position) in &blocks {
        first.mark_placed("overworld", *chunk, *position);
    }
    let removed = blocks[0];
    assert!(first.remove_placed("overworld", removed.0, removed.1));
    first.shutdown();

    let second = open(&base_dir, &config);
    for (chunk, position) in &blocks[1..] {
        assert!(
            eventually(|| second.is_placed("overworld", *chunk, *position)),
            "{:?} was lost across the restart",
            position
        );
    }
    assert!(!second.is_placed("overworld", removed.0, removed.1));
    second.shutdown();

    let _ = fs::remove_dir_all(&base_dir);
}

#[test]
fn ledger_files_use_the_documented_layout() {
    let base_dir = unique_base_dir("layout");
    let config = LedgerConfig::default();

    let ledger = open(&base_dir, &config);
    ledger.mark_placed("my_world", Point2::new(-1, 4), Point3::new(5, 64, 6));
    ledger.mark_placed("my_world", Point2::new(-1, 4), Point3::new(7, 65, 8));
    ledger.shutdown();

    let file = base_dir
        .join("region_blocks")
        .join("my_world")
        .join("region_-1_4.dat");
    let mut body = Vec::new();
    GzDecoder::new(File::open(&file).unwrap())
        .read_to_end(&mut body)
        .unwrap();

    assert_eq!(i32::from_be_bytes(body[..4].try_into().unwrap()), 2);
    let entries: HashSet<i64> = body[4..]
        .chunks_exact(8)
        .map(|entry| i64::from_be_bytes(entry.try_into().unwrap()))
        .collect();
    assert_eq!(entries, HashSet::from([pack(5, 64, 6), pack(7, 65, 8)]));

    let _ = fs::remove_dir_all(&base_dir);
}

#[test]
fn untouched_chunks_write_nothing() {
    let base_dir = unique_base_dir("untouched");
    let config = LedgerConfig::default();

    let ledger = open(&base_dir, &config);
    assert!(!ledger.is_placed("overworld", Point2::new(0, 0), Point3::new(0, 0, 0)));
    ledger.shutdown();

    assert!(!base_dir.join("region_blocks").join("overworld").exists());
    let _ = fs::remove_dir_all(&base_dir);
}
