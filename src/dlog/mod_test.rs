use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::env;

use super::*;
use crate::bcache::MARKER_NODE;

fn test_log(name: &str) -> DocLog {
    let loc: std::path::PathBuf = [env::temp_dir(), name.into()].iter().collect();
    std::fs::remove_file(&loc).ok();
    let blk = BlockFile::open(loc.as_os_str(), 4096, 1024 * 1024, true).unwrap();
    DocLog::new(Arc::new(blk))
}

#[test]
fn test_append_read() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_append_read {}", seed);

    let log = test_log("test-dlog-append.data");

    let mut offsets = vec![];
    for i in 0..500_u64 {
        // some records larger than a block, to exercise spanning.
        let n = match rng.gen::<u8>() % 10 {
            0 => 4096 + (rng.gen::<usize>() % 8192),
            _ => rng.gen::<usize>() % 512,
        };
        let doc = Doc::new_set(
            0,
            format!("key{}", i).into_bytes(),
            vec![],
            (0..n).map(|_| rng.gen()).collect(),
            i + 1,
        );
        let off = log.append_doc(&doc).unwrap();
        offsets.push((off, doc));
    }

    for (off, doc) in offsets.iter() {
        let out = log.read_doc(*off).unwrap();
        assert_eq!(&out, doc);

        let meta = log.read_doc_meta(*off).unwrap();
        assert_eq!(meta.key, doc.key);
        assert!(meta.body.is_empty());

        assert!(log.rec_size(*off).unwrap() > doc.body.len());
    }
}

#[test]
fn test_scan_skips_foreign_blocks() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_scan_skips_foreign_blocks {}", seed);

    let log = test_log("test-dlog-scan.data");
    let blk = Arc::clone(log.as_blockfile());

    let mut docs = vec![];
    for i in 0..100_u64 {
        let doc = Doc::new_set(
            0,
            format!("key{}", i).into_bytes(),
            vec![],
            (0..rng.gen::<usize>() % 256).map(|_| rng.gen()).collect(),
            i + 1,
        );
        log.append_doc(&doc).unwrap();
        docs.push(doc);
        // interleave node blocks, scan must hop over them.
        if (i % 7) == 0 {
            blk.alloc(MARKER_NODE).unwrap();
        }
    }

    let to = log.tail_offset();
    let mut iter = log.scan(0, to);
    for doc in docs.iter() {
        loop {
            let (_, kind, payload) = iter.next().unwrap().unwrap();
            if kind == REC_DOC {
                let (out, _) = crate::util::from_cbor_bytes::<Doc>(&payload).unwrap();
                assert_eq!(&out, doc);
                break;
            }
        }
    }
    assert!(iter.next().is_none());
}

#[test]
fn test_crc_detects_damage() {
    let log = test_log("test-dlog-crc.data");
    let blk = Arc::clone(log.as_blockfile());

    let doc = Doc::new_set(0, b"key".to_vec(), vec![], vec![7; 64], 1);
    let off = log.append_doc(&doc).unwrap();
    assert_eq!(log.read_doc(off).unwrap(), doc);

    // flip one payload byte in place, while the block is still writable.
    blk.with_mut(0, |data| {
        data[40] ^= 0xff;
        Ok(())
    })
    .unwrap();

    match log.read_doc(off) {
        Err(crate::Error::ChecksumError(_, _)) => (),
        res => panic!("expected checksum error {:?}", res),
    }
}
