use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{sync::Arc, thread};

use super::*;

#[test]
fn test_spinlock_readers_only() {
    let lock: Arc<Spinlock<Vec<u64>>> = Arc::new(Spinlock::new((0..100).collect()));

    let mut handles = vec![];
    for _id in 0..4 {
        let lock = Arc::clone(&lock);
        handles.push(thread::spawn(move || {
            for _i in 0..1_000 {
                let val = lock.read();
                assert_eq!(val.len(), 100);
                assert_eq!(val[7], 7);
            }
        }));
    }
    for handle in handles.into_iter() {
        handle.join().unwrap();
    }
}

#[test]
fn test_spinlock_rw() {
    let seed: u64 = random();
    println!("test_spinlock_rw {}", seed);

    let lock: Arc<Spinlock<(u64, u64)>> = Arc::new(Spinlock::new((0, 0)));
    assert_eq!(lock.to_conflicts(), 0);

    let n_threads = 6_u64;
    let n_ops = 2_000_u64;

    let mut handles = vec![];
    for id in 0..n_threads {
        let lock = Arc::clone(&lock);
        handles.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed + id);
            for _i in 0..n_ops {
                if rng.gen::<u8>() % 3 == 0 {
                    let mut val = lock.write();
                    // both halves mutate under the same guard; readers
                    // must never observe them apart.
                    val.0 += 1;
                    val.1 += 1;
                } else {
                    let val = lock.read();
                    assert_eq!(val.0, val.1);
                }
            }
        }));
    }
    for handle in handles.into_iter() {
        handle.join().unwrap();
    }

    let val = lock.read();
    assert_eq!(val.0, val.1);
    assert!(val.0 <= (n_threads * n_ops), "{}", val.0);
    println!("test_spinlock_rw conflicts {}", lock.to_conflicts());
}
