use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{collections::BTreeMap, env};

use super::*;

fn test_parts(name: &str) -> (Arc<BlockFile>, Arc<DocLog>) {
    let loc: std::path::PathBuf = [env::temp_dir(), name.into()].iter().collect();
    std::fs::remove_file(&loc).ok();
    let blk = Arc::new(BlockFile::open(loc.as_os_str(), 4096, 8 * 1024 * 1024, true).unwrap());
    let log = Arc::new(DocLog::new(Arc::clone(&blk)));
    (blk, log)
}

fn random_key(rng: &mut SmallRng) -> Vec<u8> {
    // lengths straddling the chunk width, from a narrow alphabet, to
    // force shared prefixes, suffix splits and layered descent.
    let n = (rng.gen::<usize>() % 40) + 1;
    (0..n).map(|_| b'a' + (rng.gen::<u8>() % 4)).collect()
}

#[test]
fn test_trie_ops() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_trie_ops {}", seed);

    let (blk, log) = test_parts("test-trie-ops.data");
    let mut trie = Trie::new(CHUNKSIZE);
    let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
    let mut next_off = 1_u64;

    for _i in 0..10_000 {
        let key = random_key(&mut rng);
        match rng.gen::<u8>() % 5 {
            0 => {
                let old = trie.remove(&blk, &log, &key).unwrap();
                assert_eq!(old, model.remove(&key), "del {:?}", key);
            }
            _ => {
                let off = next_off;
                next_off += 1;
                let old = trie.insert(&blk, &log, &key, off).unwrap();
                assert_eq!(old, model.insert(key.clone(), off), "set {:?}", key);
            }
        }
    }

    for (key, off) in model.iter() {
        assert_eq!(trie.get(&blk, &log, key).unwrap(), Some(*off), "get {:?}", key);
    }
    for _i in 0..1000 {
        let key = random_key(&mut rng);
        if !model.contains_key(&key) {
            assert_eq!(trie.get(&blk, &log, &key).unwrap(), None);
        }
    }

    // ascending full iteration agrees with the model.
    let mut iter = trie.iter(Arc::clone(&blk), Arc::clone(&log), Bound::Unbounded).unwrap();
    for (key, off) in model.iter() {
        let (k, o) = iter.next_entry().unwrap().unwrap();
        assert_eq!(&k, key);
        assert_eq!(o, *off);
    }
    assert!(iter.next_entry().unwrap().is_none());
}

#[test]
fn test_trie_long_keys() {
    let (blk, log) = test_parts("test-trie-long.data");
    let mut trie = Trie::new(CHUNKSIZE);

    // deep shared prefix, divergence far beyond the first chunk.
    let prefix = vec![b'p'; 300];
    let mut keys = vec![];
    for i in 0..50_u64 {
        let mut key = prefix.clone();
        key.extend_from_slice(format!("suffix-{:03}", i).as_bytes());
        trie.insert(&blk, &log, &key, i + 1).unwrap();
        keys.push(key);
    }
    // and one key that is an exact prefix of the others.
    trie.insert(&blk, &log, &prefix, 1000).unwrap();

    for (i, key) in keys.iter().enumerate() {
        assert_eq!(trie.get(&blk, &log, key).unwrap(), Some(i as u64 + 1));
    }
    assert_eq!(trie.get(&blk, &log, &prefix).unwrap(), Some(1000));
    assert_eq!(trie.get(&blk, &log, &prefix[..100]).unwrap(), None);

    // iteration yields the bare prefix first, then the suffixed keys.
    let mut iter = trie.iter(Arc::clone(&blk), Arc::clone(&log), Bound::Unbounded).unwrap();
    let (k, o) = iter.next_entry().unwrap().unwrap();
    assert_eq!(k, prefix);
    assert_eq!(o, 1000);
    for key in keys.iter() {
        let (k, _) = iter.next_entry().unwrap().unwrap();
        assert_eq!(&k, key);
    }
    assert!(iter.next_entry().unwrap().is_none());
}

#[test]
fn test_trie_range_start() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_trie_range_start {}", seed);

    let (blk, log) = test_parts("test-trie-range.data");
    let mut trie = Trie::new(CHUNKSIZE);
    let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

    for i in 0..2000_u64 {
        let key = random_key(&mut rng);
        trie.insert(&blk, &log, &key, i + 1).unwrap();
        model.insert(key, i + 1);
    }

    for _i in 0..100 {
        let probe = random_key(&mut rng);

        let mut iter = trie
            .iter(Arc::clone(&blk), Arc::clone(&log), Bound::Included(probe.clone()))
            .unwrap();
        let want: Vec<&Vec<u8>> = model.range(probe.clone()..).map(|(k, _)| k).collect();
        for key in want.into_iter() {
            let (k, o) = iter.next_entry().unwrap().unwrap();
            assert_eq!(&k, key, "start {:?}", probe);
            assert_eq!(o, model[key]);
        }
        assert!(iter.next_entry().unwrap().is_none());
    }
}

#[test]
fn test_trie_floor() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_trie_floor {}", seed);

    let (blk, log) = test_parts("test-trie-floor.data");
    let mut trie = Trie::new(CHUNKSIZE);
    let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

    for i in 0..2000_u64 {
        let key = random_key(&mut rng);
        trie.insert(&blk, &log, &key, i + 1).unwrap();
        model.insert(key, i + 1);
    }

    for _i in 0..500 {
        let probe = random_key(&mut rng);
        let want = model.range(..=probe.clone()).next_back().map(|(k, _)| k.clone());
        let got = trie.floor_key(&blk, &log, &probe).unwrap();
        assert_eq!(got, want, "probe {:?}", probe);
    }
}

#[test]
fn test_trie_collapse() {
    let (blk, log) = test_parts("test-trie-collapse.data");
    let mut trie = Trie::new(CHUNKSIZE);

    let a = b"0123456789abcdef-first".to_vec();
    let b = b"0123456789abcdef-second".to_vec();
    trie.insert(&blk, &log, &a, 1).unwrap();
    trie.insert(&blk, &log, &b, 2).unwrap();

    // removing one of a diverged pair folds the survivor back into a
    // suffix record; the key must stay reachable.
    assert_eq!(trie.remove(&blk, &log, &b).unwrap(), Some(2));
    assert_eq!(trie.get(&blk, &log, &a).unwrap(), Some(1));
    assert_eq!(trie.get(&blk, &log, &b).unwrap(), None);

    assert_eq!(trie.remove(&blk, &log, &a).unwrap(), Some(1));
    assert!(trie.is_empty());
}
