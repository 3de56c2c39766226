use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::util;

fn random_doc(rng: &mut SmallRng) -> Doc {
    let key: Vec<u8> = (0..(rng.gen::<usize>() % 128) + 1).map(|_| rng.gen()).collect();
    let meta: Vec<u8> = (0..rng.gen::<usize>() % 64).map(|_| rng.gen()).collect();
    let body: Vec<u8> = (0..rng.gen::<usize>() % 1024).map(|_| rng.gen()).collect();
    match rng.gen::<u8>() % 4 {
        0 => Doc::new_del(rng.gen::<u64>() % 4, key, meta, rng.gen()),
        _ => Doc::new_set(rng.gen::<u64>() % 4, key, meta, body, rng.gen()),
    }
}

#[test]
fn test_doc_cbor() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_doc_cbor {}", seed);

    for _i in 0..200 {
        let doc = random_doc(&mut rng);
        let data = util::into_cbor_bytes(doc.clone()).unwrap();
        let (out, _) = util::from_cbor_bytes::<Doc>(&data).unwrap();
        assert_eq!(out, doc);
    }
}

#[test]
fn test_doc_tombstone() {
    let doc = Doc::new_del(1, b"key".to_vec(), b"meta".to_vec(), 10);
    assert!(doc.is_deleted());
    assert!(doc.body.is_empty());
    assert_eq!(doc.to_seqno(), 10);

    let a = Doc::new_set(0, b"a".to_vec(), vec![], b"x".to_vec(), 1);
    let b = Doc::new_set(0, b"b".to_vec(), vec![], b"y".to_vec(), 2);
    assert!(a < b);
}
