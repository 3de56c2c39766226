use std::{env, fs, path, thread, time::Duration};

use super::*;
use crate::store::{CommitMode, CompactionMode, Config, Db, IsolationLevel, IterFlags};

fn test_location(name: &str) -> ffi::OsString {
    let loc: path::PathBuf = [env::temp_dir(), name.into()].iter().collect();
    fs::remove_file(&loc).ok();
    loc.into_os_string()
}

#[test]
fn test_compact_preserves_mappings() {
    let loc = test_location("test-compact-basic.data");
    let new_loc = test_location("test-compact-basic.data.1");

    let db = Db::open(&loc, Config::default()).unwrap();
    let store = db.open_store("").unwrap();

    let n = 500_u64;
    // three generations of every key bloat the file with stale copies.
    for round in 0..3 {
        for i in 0..n {
            store
                .set(
                    format!("key{:04}", i).as_bytes(),
                    b"",
                    format!("round{}", round).as_bytes(),
                )
                .unwrap();
        }
        db.commit(CommitMode::ManualWalFlush).unwrap();
    }
    // and a few tombstones.
    for i in 0..50_u64 {
        store.del(format!("key{:04}", i).as_bytes(), b"").unwrap();
    }
    db.commit(CommitMode::ManualWalFlush).unwrap();

    let before = db.info().unwrap().file_size;
    db.compact(&new_loc).unwrap();
    let after = db.info().unwrap().file_size;

    assert!(after < before, "{} < {}", after, before);
    assert_eq!(db.info().unwrap().path, new_loc);
    assert!(!path::Path::new(&loc).exists());

    // key -> newest doc mapping preserved; purged tombstones read as
    // missing keys.
    for i in 0..50_u64 {
        assert!(store.get(format!("key{:04}", i).as_bytes()).is_err());
    }
    for i in (50..n).step_by(17) {
        let doc = store.get(format!("key{:04}", i).as_bytes()).unwrap();
        assert_eq!(doc.body, b"round2".to_vec());
        // seqno -> doc mapping preserved for surviving seqnos.
        assert_eq!(store.get_byseq(doc.seqno).unwrap().key, doc.key);
    }
    assert_eq!(store.info().unwrap().doc_count, n - 50);
    assert_eq!(store.info().unwrap().last_seqnum, 3 * n + 50);

    // and the compacted file recovers cleanly.
    drop(store);
    db.close().unwrap();
    let db = Db::open(&new_loc, Config::default()).unwrap();
    let store = db.open_store("").unwrap();
    assert_eq!(store.info().unwrap().last_seqnum, 3 * n + 50);
    assert_eq!(store.get(b"key0400").unwrap().body, b"round2".to_vec());

    fs::remove_file(&new_loc).ok();
}

#[test]
fn test_compact_under_writes() {
    let loc = test_location("test-compact-writes.data");
    let new_loc = test_location("test-compact-writes.data.1");

    let db = Db::open(&loc, Config::default()).unwrap();
    let store = db.open_store("").unwrap();

    for i in 0..2000_u64 {
        store.set(format!("base{:05}", i).as_bytes(), b"", b"v").unwrap();
    }
    db.commit(CommitMode::ManualWalFlush).unwrap();

    // writers keep going while the compactor copies.
    let writer = {
        let db = db.clone();
        let store = db.open_store("").unwrap();
        thread::spawn(move || {
            for i in 0..500_u64 {
                store.set(format!("live{:05}", i).as_bytes(), b"", b"w").unwrap();
                if i % 50 == 0 {
                    db.commit(CommitMode::Normal).unwrap();
                }
            }
            db.commit(CommitMode::Normal).unwrap();
        })
    };

    db.compact(&new_loc).unwrap();
    writer.join().unwrap();
    // whatever landed after the swap still commits fine.
    db.commit(CommitMode::ManualWalFlush).unwrap();

    for i in (0..2000_u64).step_by(97) {
        assert!(store.get(format!("base{:05}", i).as_bytes()).is_ok());
    }
    for i in 0..500_u64 {
        let doc = store.get(format!("live{:05}", i).as_bytes()).unwrap();
        assert_eq!(doc.body, b"w".to_vec(), "live{:05}", i);
    }
    assert_eq!(store.info().unwrap().last_seqnum, 2500);
    println!(
        "test_compact_under_writes lock conflicts {}",
        db.info().unwrap().lock_conflicts
    );

    fs::remove_file(&new_loc).ok();
}

#[test]
fn test_compact_guards() {
    let loc = test_location("test-compact-guards.data");
    let new_loc = test_location("test-compact-guards.data.1");

    let db = Db::open(&loc, Config::default()).unwrap();
    let store = db.open_store("").unwrap();
    store.set(b"key", b"", b"v").unwrap();
    db.commit(CommitMode::Normal).unwrap();

    // live transactions block compaction; their buffered offsets would
    // dangle across the swap.
    let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    assert!(matches!(db.compact(&new_loc), Err(Error::FailByTransaction(_, _))));
    txn.abort().unwrap();

    db.compact(&new_loc).unwrap();
    assert_eq!(store.get(b"key").unwrap().body, b"v".to_vec());

    fs::remove_file(&new_loc).ok();
}

#[test]
fn test_auto_compaction_under_snapshots() {
    let loc = test_location("test-compact-auto.data");

    let mut config = Config::default();
    config
        .set_compaction_mode(CompactionMode::Auto)
        .set_compactor_sleep_duration(1)
        .set_compaction_threshold(30);

    let db = Db::open(&loc, config).unwrap();
    let store = db.open_store("").unwrap();

    let n = 3000_u64;
    let mut snaps = vec![];
    for i in 0..n {
        // overwriting a narrow key-space piles up stale copies, which
        // keeps the auto compactor busy.
        let key = format!("key{:04}", i % 500);
        store.set(key.as_bytes(), b"", format!("body{}", i).as_bytes()).unwrap();

        let seqno = i + 1;
        if seqno % 10 == 0 {
            db.commit(CommitMode::Normal).unwrap();
        }
        if seqno % 100 == 0 {
            snaps.push((seqno, store.snapshot(seqno).unwrap()));
        }
        if seqno % 500 == 0 {
            thread::sleep(Duration::from_millis(1100));
        }
    }
    db.commit(CommitMode::ManualWalFlush).unwrap();

    // every snapshot keeps resolving its pinned seqno to the key that
    // carried it, across however many swaps happened since.
    for (seqno, snap) in snaps.iter() {
        assert_eq!(snap.info().unwrap().last_seqnum, *seqno);
        let doc = snap.get_byseq(*seqno).unwrap();
        let want = format!("key{:04}", (*seqno - 1) % 500).into_bytes();
        assert_eq!(doc.key, want, "snapshot at {}", seqno);
        assert_eq!(doc.body, format!("body{}", *seqno - 1).into_bytes());
    }

    // the live handle sees the newest generation.
    let docs: Vec<_> = store
        .iter(None, None, IterFlags::default())
        .unwrap()
        .map(|doc| doc.unwrap())
        .collect();
    assert_eq!(docs.len(), 500);

    fs::remove_file(db.info().unwrap().path.as_os_str()).ok();
}
