use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::{bcache::MARKER_NODE, btree::BytesKv};

#[test]
fn test_node_codec() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_node_codec {}", seed);

    let mut node = Node::new_leaf(9, 8);
    for i in 0..100_u64 {
        let mut key = vec![0; 9];
        key[1..9].copy_from_slice(&(i * 2).to_be_bytes());
        node.insert_at(node.nentry(), &key, &rng.gen::<u64>().to_be_bytes());
    }
    node.set_meta(b"prefix-run".to_vec());

    let data = node.encode(MARKER_NODE, 4096).unwrap();
    assert_eq!(data.len(), 4096);

    let out = Node::decode(MARKER_NODE, &data).unwrap();
    assert_eq!(out.nentry(), 100);
    assert_eq!(out.meta, b"prefix-run".to_vec());
    assert_eq!(out.level, 1);
    assert!(out.is_leaf());
    for i in 0..100 {
        assert_eq!(out.key_at(i), node.key_at(i));
        assert_eq!(out.val_at(i), node.val_at(i));
    }

    assert!(Node::decode(MARKER_NODE, &vec![0_u8; 4096]).is_err());
}

#[test]
fn test_node_search() {
    let mut node = Node::new_leaf(8, 8);
    for i in 0..50_u64 {
        node.insert_at(
            node.nentry(),
            &(i * 2).to_be_bytes(),
            &i.to_be_bytes(),
        );
    }

    for i in 0..50_u64 {
        assert_eq!(node.search::<BytesKv>(&(i * 2).to_be_bytes()), Ok(i as usize));
        assert_eq!(
            node.search::<BytesKv>(&(i * 2 + 1).to_be_bytes()),
            Err(i as usize + 1)
        );
    }
    assert_eq!(node.search::<BytesKv>(&u64::MAX.to_be_bytes()), Err(50));
}

#[test]
fn test_node_split_merge() {
    let mut node = Node::new_leaf(8, 8);
    for i in 0..101_u64 {
        node.insert_at(node.nentry(), &i.to_be_bytes(), &i.to_be_bytes());
    }
    node.set_meta(b"meta".to_vec());

    let right = node.split_off();
    assert_eq!(node.nentry(), 50);
    assert_eq!(right.nentry(), 51);
    assert!(node.meta.is_empty() && right.meta.is_empty());
    assert_eq!(right.key_at(0), &50_u64.to_be_bytes());

    node.merge_from(&right);
    assert_eq!(node.nentry(), 101);
    for i in 0..101_u64 {
        assert_eq!(node.key_at(i as usize), &i.to_be_bytes());
    }
}
