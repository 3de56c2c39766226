use cbordata::Cborize;
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
struct Value {
    num: u64,
    data: Vec<u8>,
}

impl Value {
    const ID: u32 = 0x1;
}

#[test]
fn test_cbor_bytes() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_cbor_bytes {}", seed);

    for _i in 0..100 {
        let val = Value {
            num: rng.gen(),
            data: (0..rng.gen::<usize>() % 1024).map(|_| rng.gen()).collect(),
        };
        let data = into_cbor_bytes(val.clone()).unwrap();
        let (out, n) = from_cbor_bytes::<Value>(&data).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(out, val);
    }
}

#[test]
fn test_be_bytes() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_be_bytes {}", seed);

    assert_eq!(from_be_bytes(&to_be_bytes(0)).unwrap(), 0);
    assert_eq!(from_be_bytes(&to_be_bytes(u64::MAX)).unwrap(), u64::MAX);

    for _i in 0..1000 {
        let (a, b) = (rng.gen::<u64>(), rng.gen::<u64>());
        assert_eq!(to_be_bytes(a) < to_be_bytes(b), a < b);
    }
}

#[test]
fn test_open_file_rw() {
    use std::env;

    let file: std::path::PathBuf =
        [env::temp_dir(), "test-open-file-rw.data".into()].iter().collect();
    std::fs::remove_file(&file).ok();

    assert!(open_file_rw(file.as_os_str(), false).is_err());

    let fd = open_file_rw(file.as_os_str(), true).unwrap();
    std::mem::drop(fd);
    let fd = open_file_rw(file.as_os_str(), false);
    assert!(fd.is_ok());

    std::fs::remove_file(&file).ok();
}
