//! Commit durability and restart tests
//!
//! Commits run against a real log file. After a restart the recovered
//! store must hold exactly the acknowledged commits, and the transaction
//! manager must continue numbering after them.

use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;
use tessera_concurrency::{RecoveryCoordinator, TransactionManager, TransactionManagerConfig};
use tessera_core::{ConcurrencyProtocol, Tuple, TupleSlot, Value};
use tessera_durability::{scan_log, DurabilityMode, LogManager, LogRecord, LOG_FILE_NAME};
use tessera_storage::VersionStore;

fn row(v: i64) -> Tuple {
    Tuple::new(vec![Value::Int(v)])
}

fn open(dir: &TempDir, mode: DurabilityMode, protocol: ConcurrencyProtocol) -> TransactionManager {
    let path = dir.path().join(LOG_FILE_NAME);
    let store = Arc::new(VersionStore::new(32));
    let recovered = RecoveryCoordinator::new(&path).recover(&store).unwrap();
    let log = LogManager::open(&path, mode, 4, recovered.highest_commit_id).unwrap();
    TransactionManager::with_ids(
        TransactionManagerConfig::new(protocol),
        store,
        Arc::new(log),
        recovered.highest_commit_id,
        recovered.max_txn_id,
    )
}

// ============================================================================
// Group commit barrier
// ============================================================================

#[test]
fn test_commit_returns_only_after_flush() {
    let dir = TempDir::new().unwrap();
    let tm = Arc::new(open(
        &dir,
        DurabilityMode::Always,
        ConcurrencyProtocol::TimestampOrdering,
    ));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let tm = Arc::clone(&tm);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..25 {
                    let slot = tm.allocate_slot();
                    let mut ctx = tm.begin();
                    tm.insert(&mut ctx, slot, row(t * 100 + i)).unwrap();
                    let cid = tm.commit(&mut ctx).unwrap();
                    assert!(tm.log().highest_flushed_commit_id() >= cid);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(tm.last_commit_id(), 100);

    let scan = scan_log(dir.path().join(LOG_FILE_NAME)).unwrap();
    let commits: Vec<u64> = scan.records.iter().filter_map(|r| r.commit_id()).collect();
    assert_eq!(commits, (1..=100).collect::<Vec<_>>());
}

#[test]
fn test_standard_mode_acknowledges_on_timer() {
    let dir = TempDir::new().unwrap();
    let mode = DurabilityMode::Standard {
        interval_ms: 2,
        batch_size: 1_000,
    };
    let tm = open(&dir, mode, ConcurrencyProtocol::OptimisticCopy);
    let slot = tm.allocate_slot();
    let mut ctx = tm.begin();
    tm.insert(&mut ctx, slot, row(1)).unwrap();
    let cid = tm.commit(&mut ctx).unwrap();
    assert!(tm.log().highest_flushed_commit_id() >= cid);
}

#[test]
fn test_cache_mode_writes_no_log() {
    let dir = TempDir::new().unwrap();
    let tm = open(&dir, DurabilityMode::Cache, ConcurrencyProtocol::TimestampOrdering);
    let slot = tm.allocate_slot();
    let mut ctx = tm.begin();
    tm.insert(&mut ctx, slot, row(1)).unwrap();
    assert_eq!(tm.commit(&mut ctx).unwrap(), 1);
    assert!(!dir.path().join(LOG_FILE_NAME).exists());
}

// ============================================================================
// Restart
// ============================================================================

#[test]
fn test_restart_recovers_acknowledged_commits() {
    let dir = TempDir::new().unwrap();
    let mut slots: Vec<TupleSlot> = Vec::new();

    {
        let tm = open(&dir, DurabilityMode::Always, ConcurrencyProtocol::TwoPhaseLocking);
        for v in 0..10 {
            let slot = tm.allocate_slot();
            let mut ctx = tm.begin();
            tm.insert(&mut ctx, slot, row(v)).unwrap();
            tm.commit(&mut ctx).unwrap();
            slots.push(slot);
        }

        let mut ctx = tm.begin();
        tm.update(&mut ctx, slots[0], row(100)).unwrap();
        tm.delete(&mut ctx, slots[1]).unwrap();
        assert_eq!(tm.commit(&mut ctx).unwrap(), 11);

        // rolled back: must not survive
        let mut ctx = tm.begin();
        tm.update(&mut ctx, slots[2], row(-1)).unwrap();
        tm.abort(&mut ctx);

        // never finished: must not survive
        let mut ctx = tm.begin();
        tm.update(&mut ctx, slots[3], row(-1)).unwrap();
        tm.log().flush_now().unwrap();
        drop(ctx);
    }

    let scan = scan_log(dir.path().join(LOG_FILE_NAME)).unwrap();
    assert!(scan
        .records
        .iter()
        .any(|r| matches!(r, LogRecord::Abort { .. })));

    let tm = open(&dir, DurabilityMode::Always, ConcurrencyProtocol::TwoPhaseLocking);
    assert_eq!(tm.last_commit_id(), 11);

    let mut ctx = tm.begin();
    assert_eq!(tm.read(&mut ctx, slots[0]).unwrap(), Some(row(100)));
    assert_eq!(tm.read(&mut ctx, slots[1]).unwrap(), None);
    assert_eq!(tm.read(&mut ctx, slots[2]).unwrap(), Some(row(2)));
    assert_eq!(tm.read(&mut ctx, slots[3]).unwrap(), Some(row(3)));
    assert_eq!(tm.read(&mut ctx, slots[9]).unwrap(), Some(row(9)));
    assert_eq!(tm.commit(&mut ctx).unwrap(), 12);

    // fresh slots never collide with recovered ones
    let fresh = tm.allocate_slot();
    assert!(!slots.contains(&fresh));
}
