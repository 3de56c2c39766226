//! Module implement the in-memory write-ahead-buffer.
//!
//! Fresh writes land here before any tree is touched: the document is
//! already durable in the log, the buffer only indexes it, by key and by
//! seqno, until a commit flushes the batch into the trees. The buffer is
//! partitioned: one shared partition holds committed writes, plus one
//! private partition per live transaction. Transaction commit merges the
//! private partition into the shared one, abort simply drops it.
//!
//! Entries dedupe by key within a partition; the older seqno of a
//! shadowed entry leaves the by-seqno index with it.

use std::collections::{BTreeMap, HashMap, HashSet};

/// A write indexed by the buffer. `off` locates the document record,
/// `size` is its on-disk footprint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalItem {
    pub off: u64,
    pub seqno: u64,
    pub deleted: bool,
    pub size: usize,
}

/// One buffer partition, ordered both by key and by seqno.
#[derive(Clone, Default)]
pub struct Partition {
    by_key: BTreeMap<Vec<u8>, WalItem>,
    by_seq: BTreeMap<u64, Vec<u8>>,
}

impl Partition {
    pub fn put(&mut self, key: Vec<u8>, item: WalItem) {
        let seqno = item.seqno;
        if let Some(old) = self.by_key.insert(key.clone(), item) {
            self.by_seq.remove(&old.seqno);
        }
        self.by_seq.insert(seqno, key);
    }

    pub fn get(&self, key: &[u8]) -> Option<&WalItem> {
        self.by_key.get(key)
    }

    pub fn get_byseq(&self, seqno: u64) -> Option<&WalItem> {
        self.by_seq.get(&seqno).and_then(|key| self.by_key.get(key))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &WalItem)> {
        self.by_key.iter()
    }

    /// Entries in ascending seqno order, within `[from, to]`. An empty
    /// range yields nothing.
    pub fn iter_seq(&self, from: u64, to: u64) -> impl Iterator<Item = (&Vec<u8>, &WalItem)> {
        let range = match from <= to {
            true => Some(self.by_seq.range(from..=to)),
            false => None,
        };
        range.into_iter().flatten().filter_map(move |(_, key)| {
            self.by_key.get(key).map(|item| (key, item))
        })
    }

    fn min_offset(&self) -> Option<u64> {
        self.by_key.values().map(|item| item.off).min()
    }

    fn merge_into(self, other: &mut Partition) {
        for (key, item) in self.by_key.into_iter() {
            match other.by_key.get(&key) {
                Some(cur) if cur.seqno > item.seqno => (),
                _ => other.put(key, item),
            }
        }
    }
}

#[derive(Default)]
struct StoreWal {
    committed: Partition,
    txns: HashMap<u64, Partition>,
    // last issued seqno, running ahead of commits.
    next_seqno: u64,
    // highest seqno sitting in (or flushed out of) the committed
    // partition.
    committed_seqno: u64,
}

/// Write-ahead-buffer for every store of one file.
#[derive(Default)]
pub struct Wal {
    stores: HashMap<u64, StoreWal>,
    live: HashSet<u64>,
}

/// Visibility rule for buffer reads.
#[derive(Clone, Copy, Debug)]
pub enum WalView {
    /// Committed partition only.
    Committed,
    /// Own partition first, then the committed one.
    Txn(u64),
    /// Every partition, newest seqno wins.
    Uncommitted,
}

impl Wal {
    pub fn new() -> Wal {
        Wal::default()
    }

    fn store_mut(&mut self, store: u64) -> &mut StoreWal {
        self.stores.entry(store).or_insert_with(StoreWal::default)
    }

    /// Issue the next seqno for `store`.
    pub fn alloc_seqno(&mut self, store: u64) -> u64 {
        let sw = self.store_mut(store);
        sw.next_seqno += 1;
        sw.next_seqno
    }

    /// Reset `store`'s seqno state, at open, rollback and store drop.
    pub fn reset_seqno(&mut self, store: u64, seqno: u64) {
        let sw = self.store_mut(store);
        sw.next_seqno = seqno;
        sw.committed_seqno = seqno;
    }

    /// Highest seqno every commit of `store` shall cover.
    pub fn committed_seqno(&self, store: u64) -> u64 {
        self.stores.get(&store).map(|sw| sw.committed_seqno).unwrap_or(0)
    }

    /// Index a write. `txn` routes it into a private partition.
    pub fn put(&mut self, store: u64, key: Vec<u8>, item: WalItem, txn: Option<u64>) {
        let sw = self.store_mut(store);
        match txn {
            Some(id) => sw.txns.entry(id).or_insert_with(Partition::default).put(key, item),
            None => {
                sw.committed_seqno = u64::max(sw.committed_seqno, item.seqno);
                sw.committed.put(key, item);
            }
        }
    }

    pub fn get(&self, store: u64, key: &[u8], view: WalView) -> Option<WalItem> {
        let sw = self.stores.get(&store)?;
        match view {
            WalView::Committed => sw.committed.get(key).cloned(),
            WalView::Txn(id) => match sw.txns.get(&id).and_then(|p| p.get(key)) {
                Some(item) => Some(item.clone()),
                None => sw.committed.get(key).cloned(),
            },
            WalView::Uncommitted => {
                let mut best = sw.committed.get(key);
                for p in sw.txns.values() {
                    match (best, p.get(key)) {
                        (Some(b), Some(c)) if c.seqno > b.seqno => best = Some(c),
                        (None, Some(c)) => best = Some(c),
                        _ => (),
                    }
                }
                best.cloned()
            }
        }
    }

    pub fn get_byseq(&self, store: u64, seqno: u64, view: WalView) -> Option<WalItem> {
        let sw = self.stores.get(&store)?;
        match view {
            WalView::Committed => sw.committed.get_byseq(seqno).cloned(),
            WalView::Txn(id) => match sw.txns.get(&id).and_then(|p| p.get_byseq(seqno)) {
                Some(item) => Some(item.clone()),
                None => sw.committed.get_byseq(seqno).cloned(),
            },
            WalView::Uncommitted => {
                let found = sw.committed.get_byseq(seqno);
                match found {
                    Some(item) => Some(item.clone()),
                    None => sw
                        .txns
                        .values()
                        .filter_map(|p| p.get_byseq(seqno))
                        .next()
                        .cloned(),
                }
            }
        }
    }

    /// Committed entries across every store, the flush-threshold gauge.
    pub fn committed_entries(&self) -> usize {
        self.stores.values().map(|sw| sw.committed.len()).sum()
    }

    /// Stores with at least one committed, unflushed entry.
    pub fn dirty_stores(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .stores
            .iter()
            .filter_map(|(id, sw)| if sw.committed.is_empty() { None } else { Some(*id) })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Take `store`'s committed partition for flushing, in key order.
    pub fn drain_committed(&mut self, store: u64) -> Vec<(Vec<u8>, WalItem)> {
        let sw = self.store_mut(store);
        let part = std::mem::take(&mut sw.committed);
        part.by_key.into_iter().collect()
    }

    /// Clone `store`'s committed partition, for snapshot overlays and
    /// iterators.
    pub fn snapshot_committed(&self, store: u64) -> Partition {
        self.stores.get(&store).map(|sw| sw.committed.clone()).unwrap_or_default()
    }

    /// Clone the partition a transactional iterator observes.
    pub fn snapshot_view(&self, store: u64, view: WalView) -> Partition {
        let mut part = self.snapshot_committed(store);
        let sw = match self.stores.get(&store) {
            Some(sw) => sw,
            None => return part,
        };
        match view {
            WalView::Committed => (),
            WalView::Txn(id) => {
                if let Some(p) = sw.txns.get(&id) {
                    p.clone().merge_into(&mut part);
                }
            }
            WalView::Uncommitted => {
                for p in sw.txns.values() {
                    p.clone().merge_into(&mut part);
                }
            }
        }
        part
    }

    /// Lowest document offset still held by any partition, committed or
    /// transactional. The commit header's scan start must not pass it.
    pub fn min_unflushed_offset(&self) -> Option<u64> {
        self.stores
            .values()
            .flat_map(|sw| {
                sw.committed
                    .min_offset()
                    .into_iter()
                    .chain(sw.txns.values().filter_map(|p| p.min_offset()))
            })
            .min()
    }

    /// Lowest document offset held by live transaction partitions only.
    pub fn min_txn_offset(&self) -> Option<u64> {
        self.stores
            .values()
            .flat_map(|sw| sw.txns.values().filter_map(|p| p.min_offset()))
            .min()
    }

    /// Drop every committed entry, after compaction rebuilt the trees.
    pub fn clear_committed(&mut self) {
        for sw in self.stores.values_mut() {
            sw.committed = Partition::default();
        }
    }
}

impl Wal {
    /// Register a live transaction.
    pub fn begin_txn(&mut self, id: u64) {
        self.live.insert(id);
    }

    /// Merge the transaction's partitions into the committed ones.
    pub fn commit_txn(&mut self, id: u64) {
        for sw in self.stores.values_mut() {
            if let Some(part) = sw.txns.remove(&id) {
                let high = part.by_seq.keys().next_back().copied().unwrap_or(0);
                sw.committed_seqno = u64::max(sw.committed_seqno, high);
                part.merge_into(&mut sw.committed);
            }
        }
        self.live.remove(&id);
    }

    /// Drop the transaction's partitions.
    pub fn abort_txn(&mut self, id: u64) {
        for sw in self.stores.values_mut() {
            sw.txns.remove(&id);
        }
        self.live.remove(&id);
    }

    pub fn live_txns(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
