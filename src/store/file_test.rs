use std::{env, fs, io::Write, os::unix::fs::FileExt, path};

use super::*;
use crate::store::{CommitMode, Config};

fn test_location(name: &str) -> ffi::OsString {
    let loc: path::PathBuf = [env::temp_dir(), name.into()].iter().collect();
    fs::remove_file(&loc).ok();
    loc.into_os_string()
}

#[test]
fn test_open_close_reopen() {
    let loc = test_location("test-file-reopen.data");

    {
        let db = Db::open(&loc, Config::default()).unwrap();
        let store = db.open_store("").unwrap();
        store.set(b"hello", b"", b"world").unwrap();
        db.commit(CommitMode::ManualWalFlush).unwrap();
        db.close().unwrap();
    }

    let db = Db::open(&loc, Config::default()).unwrap();
    let store = db.open_store("").unwrap();
    let doc = store.get(b"hello").unwrap();
    assert_eq!(doc.body, b"world".to_vec());
    assert_eq!(doc.seqno, 1);

    // a missing file without the create flag must fail.
    let mut config = Config::default();
    config.set_create(false);
    let gone = test_location("test-file-gone.data");
    assert!(Db::open(&gone, config).is_err());

    fs::remove_file(&loc).ok();
}

#[test]
fn test_crash_recovery_past_garbage() {
    let loc = test_location("test-file-crash.data");

    let mut config = Config::default();
    config.set_buffercache_size(0).set_wal_threshold(1024);

    let n = 10;
    let docs: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = (0..n)
        .map(|i| {
            (
                format!("key{}", i).into_bytes(),
                format!("meta{}", i).into_bytes(),
                format!("body{}", i).into_bytes(),
            )
        })
        .collect();

    {
        let db = Db::open(&loc, config.clone()).unwrap();
        let store = db.open_store("").unwrap();
        for (key, meta, body) in docs.iter() {
            store.set(key, meta, body).unwrap();
        }
        db.commit(CommitMode::Normal).unwrap();
        db.close().unwrap();
    }

    // simulate a crashed writer scribbling past the last commit: two
    // blocks of zeros at 3*4096, and a non-block-aligned zero run at
    // 20*1024, truncating like dd does.
    {
        let fd = fs::OpenOptions::new().write(true).open(&loc).unwrap();
        fd.set_len(3 * 4096).ok();
        fd.write_all_at(&vec![0_u8; 8192], 3 * 4096).unwrap();
        fd.set_len(20 * 1024).ok();
        fd.write_all_at(&vec![0_u8; 1024], 20 * 1024).unwrap();
        fd.sync_all().unwrap();
    }

    let db = Db::open(&loc, config).unwrap();
    let store = db.open_store("").unwrap();

    for (key, meta, body) in docs.iter() {
        let doc = store.get(key).unwrap();
        assert_eq!(&doc.meta, meta, "key {:?}", key);
        assert_eq!(&doc.body, body, "key {:?}", key);
    }
    for seqno in 1..=(n as u64) {
        let doc = store.get_byseq(seqno).unwrap();
        assert_eq!(doc.seqno, seqno);
        assert_eq!(doc.key, docs[(seqno - 1) as usize].0);
    }

    fs::remove_file(&loc).ok();
}

#[test]
fn test_recovery_discards_uncommitted_tail() {
    let loc = test_location("test-file-tail.data");

    {
        let db = Db::open(&loc, Config::default()).unwrap();
        let store = db.open_store("").unwrap();
        store.set(b"durable", b"", b"yes").unwrap();
        db.commit(CommitMode::Normal).unwrap();
        // these never get a commit header.
        store.set(b"lost-1", b"", b"x").unwrap();
        store.set(b"lost-2", b"", b"y").unwrap();
        db.close().unwrap();
    }

    // arbitrary garbage appended past the last valid header must not
    // alter the visible state either.
    {
        let mut fd = fs::OpenOptions::new().append(true).open(&loc).unwrap();
        fd.write_all(&vec![0xa5_u8; 3000]).unwrap();
        fd.sync_all().unwrap();
    }

    let db = Db::open(&loc, Config::default()).unwrap();
    let store = db.open_store("").unwrap();

    assert_eq!(store.get(b"durable").unwrap().body, b"yes".to_vec());
    assert!(matches!(store.get(b"lost-1"), Err(Error::KeyNotFound(_, _))));
    assert!(matches!(store.get(b"lost-2"), Err(Error::KeyNotFound(_, _))));
    // seqnos of the lost writes are re-issued.
    assert_eq!(store.info().unwrap().last_seqnum, 1);
    assert_eq!(store.set(b"fresh", b"", b"z").unwrap(), 2);

    fs::remove_file(&loc).ok();
}

#[test]
fn test_commit_normal_then_flush() {
    let loc = test_location("test-file-modes.data");

    let db = Db::open(&loc, Config::default()).unwrap();
    let store = db.open_store("").unwrap();

    for i in 0..100_u64 {
        store.set(format!("key{:03}", i).as_bytes(), b"", b"v1").unwrap();
    }
    db.commit(CommitMode::Normal).unwrap();

    // still buffered, readable all the same.
    assert_eq!(store.get(b"key050").unwrap().body, b"v1".to_vec());

    for i in 0..100_u64 {
        store.set(format!("key{:03}", i).as_bytes(), b"", b"v2").unwrap();
    }
    db.commit(CommitMode::ManualWalFlush).unwrap();

    for i in (0..100_u64).step_by(7) {
        let doc = store.get(format!("key{:03}", i).as_bytes()).unwrap();
        assert_eq!(doc.body, b"v2".to_vec());
        assert_eq!(doc.seqno, 100 + i + 1);
    }

    // by-seq lookups resolve through the seq-index after the flush; the
    // shadowed first hundred seqnos are retired with their versions.
    assert!(matches!(store.get_byseq(50), Err(Error::KeyNotFound(_, _))));
    assert_eq!(store.get_byseq(150).unwrap().body, b"v2".to_vec());

    assert_eq!(store.info().unwrap().doc_count, 100);
    assert_eq!(store.info().unwrap().last_seqnum, 200);

    fs::remove_file(&loc).ok();
}

#[test]
fn test_multi_store_file() {
    let loc = test_location("test-file-multi.data");

    {
        let db = Db::open(&loc, Config::default()).unwrap();
        let books = db.open_store("books").unwrap();
        let tapes = db.open_store("tapes").unwrap();

        // seqnos advance independently per store.
        assert_eq!(books.set(b"dune", b"", b"herbert").unwrap(), 1);
        assert_eq!(tapes.set(b"ok-computer", b"", b"radiohead").unwrap(), 1);
        assert_eq!(books.set(b"vonda", b"", b"mcintyre").unwrap(), 2);
        db.commit(CommitMode::ManualWalFlush).unwrap();
        db.close().unwrap();
    }

    let db = Db::open(&loc, Config::default()).unwrap();
    let books = db.open_store("books").unwrap();
    let tapes = db.open_store("tapes").unwrap();

    assert_eq!(books.get(b"dune").unwrap().body, b"herbert".to_vec());
    assert_eq!(tapes.get(b"ok-computer").unwrap().body, b"radiohead".to_vec());
    assert!(matches!(tapes.get(b"dune"), Err(Error::KeyNotFound(_, _))));
    assert_eq!(books.info().unwrap().last_seqnum, 2);
    assert_eq!(tapes.info().unwrap().last_seqnum, 1);

    let info = db.info().unwrap();
    assert_eq!(info.doc_count, 3);
    assert!(info.stores.contains(&"books".to_string()));

    // single-store files reject named stores.
    let mut config = Config::default();
    config.set_multi_kv_instances(false);
    let loc2 = test_location("test-file-single.data");
    let db2 = Db::open(&loc2, config).unwrap();
    assert!(db2.open_store("").is_ok());
    assert!(matches!(db2.open_store("extra"), Err(Error::InvalidInput(_, _))));

    fs::remove_file(&loc).ok();
    fs::remove_file(&loc2).ok();
}

#[test]
fn test_arbitrary_configs() {
    use arbitrary::Unstructured;
    use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_arbitrary_configs {}", seed);

    for i in 0..8 {
        let config: Config = {
            let bytes = rng.gen::<[u8; 32]>();
            let mut uns = Unstructured::new(&bytes);
            uns.arbitrary().unwrap()
        };
        println!("test_arbitrary_configs {:?}", config);

        let loc = test_location(&format!("test-file-arbitrary-{}.data", i));
        {
            let db = Db::open(&loc, config.clone()).unwrap();
            let store = db.open_store("").unwrap();
            for j in 0..100_u64 {
                store
                    .set(format!("key{:03}", j).as_bytes(), b"", format!("val{}", j).as_bytes())
                    .unwrap();
            }
            db.commit(CommitMode::ManualWalFlush).unwrap();
        }

        let db = Db::open(&loc, config).unwrap();
        let store = db.open_store("").unwrap();
        for j in (0..100_u64).step_by(11) {
            let doc = store.get(format!("key{:03}", j).as_bytes()).unwrap();
            assert_eq!(doc.body, format!("val{}", j).into_bytes());
        }
        assert_eq!(store.info().unwrap().last_seqnum, 100);

        drop(store);
        db.close().unwrap();
        fs::remove_file(&loc).ok();
    }
}

#[test]
fn test_snap_markers() {
    let loc = test_location("test-file-markers.data");

    let db = Db::open(&loc, Config::default()).unwrap();
    let store = db.open_store("").unwrap();

    assert!(db.get_all_snap_markers().unwrap().is_empty());

    for round in 1..=3_u64 {
        for i in 0..5_u64 {
            store
                .set(format!("key{}", i).as_bytes(), b"", format!("r{}", round).as_bytes())
                .unwrap();
        }
        db.commit(CommitMode::ManualWalFlush).unwrap();
    }

    let markers = db.get_all_snap_markers().unwrap();
    assert_eq!(markers.len(), 3);
    // newest first, seqnos receding.
    let seqnos: Vec<u64> = markers
        .iter()
        .map(|m| m.stores.iter().find(|(name, _)| name == "default").unwrap().1)
        .collect();
    assert_eq!(seqnos, vec![15, 10, 5]);

    fs::remove_file(&loc).ok();
}
