use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_header_codec() {
    let header = CommitHeader::new(42, 12345, 678);
    let data = header.encode_block(4096).unwrap();
    assert_eq!(data.len(), 4096);
    assert_eq!(data[0], MARKER_HEADER);

    let out = CommitHeader::decode_block(&data).unwrap();
    assert_eq!(out, header);
}

#[test]
fn test_header_rejects_damage() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_header_rejects_damage {}", seed);

    // zeroed block is no header.
    assert!(CommitHeader::decode_block(&vec![0_u8; 4096]).is_err());

    // random garbage with a valid marker is no header either.
    let mut data = vec![0_u8; 4096];
    data[0] = MARKER_HEADER;
    rng.fill(&mut data[1..128]);
    assert!(CommitHeader::decode_block(&data).is_err());

    // single flipped payload byte must fail the crc.
    let header = CommitHeader::new(7, 99, 11);
    let mut data = header.encode_block(4096).unwrap();
    data[20] ^= 0x01;
    match CommitHeader::decode_block(&data) {
        Err(Error::ChecksumError(_, _)) | Err(Error::FailCbor(_, _)) => (),
        res => panic!("expected rejection {:?}", res),
    }
}

#[test]
fn test_catalog() {
    let mut catalog = Catalog::default();
    let a = catalog.add("default");
    let b = catalog.add("books");
    assert_ne!(a, b);

    assert_eq!(catalog.by_name("books").unwrap().id, b);
    assert!(catalog.by_name("nope").is_none());

    catalog.get_mut(a).unwrap().last_seqno = 99;
    assert_eq!(catalog.get(a).unwrap().last_seqno, 99);
    assert_eq!(catalog.get(a).unwrap().trie_root, NIL_BID);

    let data = util::into_cbor_bytes(catalog.clone()).unwrap();
    let (out, _) = util::from_cbor_bytes::<Catalog>(&data).unwrap();
    assert_eq!(out, catalog);
}
