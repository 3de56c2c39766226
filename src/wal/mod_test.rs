use super::*;

fn item(off: u64, seqno: u64, deleted: bool) -> WalItem {
    WalItem { off, seqno, deleted, size: 32 }
}

#[test]
fn test_wal_partitions() {
    let mut wal = Wal::new();

    assert_eq!(wal.alloc_seqno(0), 1);
    assert_eq!(wal.alloc_seqno(0), 2);
    assert_eq!(wal.alloc_seqno(7), 1);

    wal.put(0, b"aaa".to_vec(), item(10, 1, false), None);
    wal.put(0, b"bbb".to_vec(), item(20, 2, false), None);
    wal.put(7, b"aaa".to_vec(), item(30, 1, false), None);

    assert_eq!(wal.committed_entries(), 3);
    assert_eq!(wal.committed_seqno(0), 2);
    assert_eq!(wal.get(0, b"aaa", WalView::Committed).unwrap().off, 10);
    assert_eq!(wal.get(7, b"aaa", WalView::Committed).unwrap().off, 30);
    assert_eq!(wal.get_byseq(0, 2, WalView::Committed).unwrap().off, 20);

    // shadowing a key retires its older seqno.
    let seqno = wal.alloc_seqno(0);
    wal.put(0, b"aaa".to_vec(), item(40, seqno, false), None);
    assert_eq!(wal.get_byseq(0, 1, WalView::Committed), None);
    assert_eq!(wal.get_byseq(0, 3, WalView::Committed).unwrap().off, 40);

    let drained = wal.drain_committed(0);
    assert_eq!(
        drained.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
        vec![b"aaa".to_vec(), b"bbb".to_vec()]
    );
    assert_eq!(wal.committed_entries(), 1);
    // flushing does not regress the commit watermark.
    assert_eq!(wal.committed_seqno(0), 3);
}

#[test]
fn test_wal_txn_visibility() {
    let mut wal = Wal::new();

    wal.put(0, b"base".to_vec(), item(1, 1, false), None);

    wal.begin_txn(100);
    wal.begin_txn(200);
    assert_eq!(wal.live_txns(), 2);

    wal.put(0, b"t1".to_vec(), item(2, 2, false), Some(100));
    wal.put(0, b"t2".to_vec(), item(3, 3, false), Some(200));

    // committed view is blind to both transactions.
    assert_eq!(wal.get(0, b"t1", WalView::Committed), None);
    // each transaction sees its own writes plus the committed base.
    assert_eq!(wal.get(0, b"t1", WalView::Txn(100)).unwrap().off, 2);
    assert_eq!(wal.get(0, b"t2", WalView::Txn(100)), None);
    assert_eq!(wal.get(0, b"base", WalView::Txn(100)).unwrap().off, 1);
    // dirty reads see everything.
    assert_eq!(wal.get(0, b"t1", WalView::Uncommitted).unwrap().off, 2);
    assert_eq!(wal.get(0, b"t2", WalView::Uncommitted).unwrap().off, 3);

    wal.commit_txn(100);
    assert_eq!(wal.get(0, b"t1", WalView::Committed).unwrap().off, 2);
    assert_eq!(wal.committed_seqno(0), 2);

    wal.abort_txn(200);
    assert_eq!(wal.get(0, b"t2", WalView::Uncommitted), None);
    assert_eq!(wal.live_txns(), 0);
}

#[test]
fn test_wal_snapshot_freeze() {
    let mut wal = Wal::new();

    wal.put(0, b"k1".to_vec(), item(1, 1, false), None);
    wal.put(0, b"k2".to_vec(), item(2, 2, true), None);

    let frozen = wal.snapshot_committed(0);

    // later writes do not leak into the frozen partition.
    wal.put(0, b"k3".to_vec(), item(3, 3, false), None);
    assert_eq!(frozen.len(), 2);
    assert_eq!(frozen.get(b"k3"), None);
    assert!(frozen.get(b"k2").unwrap().deleted);

    let keys: Vec<Vec<u8>> = frozen.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec()]);

    let seqs: Vec<u64> = frozen.iter_seq(1, 10).map(|(_, it)| it.seqno).collect();
    assert_eq!(seqs, vec![1, 2]);
}
