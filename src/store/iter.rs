use std::{cmp::Ordering, ops::Bound, sync::Arc, vec};

use crate::{
    btree::{Btree, Cursor, SeqnoKv},
    dlog::Doc,
    store::{file::FileState, header::StoreCat, IterFlags, SeekTo},
    trie::{Trie, TrieIter},
    util,
    wal::{Partition, WalItem},
    Error, Result,
};

/// Ordered document iterator over one store, merging the persistent trie
/// with the write-ahead overlay its handle observes. On key collisions
/// the overlay wins, it is the newer version.
///
/// The iterator pins the file state it was created against; writes and
/// compactions after that never alter what it yields.
pub struct Iter {
    state: Arc<FileState>,
    cat: StoreCat,
    part: Partition,
    chunksize: usize,
    flags: IterFlags,
    end: Bound<Vec<u8>>,

    trie_iter: TrieIter,
    trie_pending: Option<(Vec<u8>, u64)>,
    trie_done: bool,
    wal_iter: vec::IntoIter<(Vec<u8>, WalItem)>,
    wal_pending: Option<(Vec<u8>, WalItem)>,
    done: bool,
}

impl Iter {
    pub(crate) fn new(
        state: Arc<FileState>,
        cat: StoreCat,
        part: Partition,
        chunksize: usize,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
        flags: IterFlags,
    ) -> Result<Iter> {
        let trie = Trie::from_root(cat.trie_root, chunksize);
        let trie_iter =
            trie.iter(Arc::clone(&state.blk), Arc::clone(&state.log), start.clone())?;
        let wal_iter = Self::wal_entries(&part, &start);

        Ok(Iter {
            state,
            cat,
            part,
            chunksize,
            flags,
            end,
            trie_iter,
            trie_pending: None,
            trie_done: false,
            wal_iter,
            wal_pending: None,
            done: false,
        })
    }

    fn wal_entries(part: &Partition, start: &Bound<Vec<u8>>) -> vec::IntoIter<(Vec<u8>, WalItem)> {
        part.iter()
            .filter(|(key, _)| match start {
                Bound::Unbounded => true,
                Bound::Included(from) => key.as_slice() >= from.as_slice(),
                Bound::Excluded(from) => key.as_slice() > from.as_slice(),
            })
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect::<Vec<(Vec<u8>, WalItem)>>()
            .into_iter()
    }

    fn beyond_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(to) => key > to.as_slice(),
            Bound::Excluded(to) => key >= to.as_slice(),
        }
    }

    /// Re-position the iterator at `key`: the smallest entry at-or-above
    /// it ([SeekTo::Ge]) or the largest entry at-or-below it
    /// ([SeekTo::Le]). Iteration continues ascending from there.
    pub fn seek(&mut self, key: &[u8], to: SeekTo) -> Result<()> {
        let from = match to {
            SeekTo::Ge => key.to_vec(),
            SeekTo::Le => {
                let trie = Trie::from_root(self.cat.trie_root, self.chunksize);
                let tfloor = trie.floor_key(&self.state.blk, &self.state.log, key)?;
                let wfloor = self
                    .part
                    .iter()
                    .filter(|(k, _)| k.as_slice() <= key)
                    .map(|(k, _)| k.clone())
                    .last();
                match (tfloor, wfloor) {
                    (Some(a), Some(b)) => std::cmp::max(a, b),
                    (Some(a), None) => a,
                    (None, Some(b)) => b,
                    (None, None) => err_at!(IteratorFail, msg: "nothing below seek key")?,
                }
            }
        };

        let trie = Trie::from_root(self.cat.trie_root, self.chunksize);
        let start = Bound::Included(from);
        self.trie_iter = trie.iter(
            Arc::clone(&self.state.blk),
            Arc::clone(&self.state.log),
            start.clone(),
        )?;
        self.wal_iter = Self::wal_entries(&self.part, &start);
        self.trie_pending = None;
        self.wal_pending = None;
        self.trie_done = false;
        self.done = false;
        Ok(())
    }

    fn fill_pending(&mut self) -> Result<()> {
        if self.trie_pending.is_none() && !self.trie_done {
            match self.trie_iter.next_entry()? {
                Some((key, off)) if !self.beyond_end(&key) => {
                    self.trie_pending = Some((key, off))
                }
                _ => self.trie_done = true,
            }
        }
        if self.wal_pending.is_none() {
            match self.wal_iter.next() {
                Some((key, item)) if !self.beyond_end(&key) => {
                    self.wal_pending = Some((key, item))
                }
                _ => (),
            }
        }
        Ok(())
    }

    fn next_doc(&mut self) -> Result<Option<Doc>> {
        loop {
            if self.done {
                return Ok(None);
            }
            self.fill_pending()?;

            // merge: smaller key first, overlay shadows the trie.
            let pick = match (&self.wal_pending, &self.trie_pending) {
                (None, None) => Pick::Done,
                (Some(_), None) => Pick::Wal,
                (None, Some(_)) => Pick::Other,
                (Some((wk, _)), Some((tk, _))) => match wk.cmp(tk) {
                    Ordering::Less => Pick::Wal,
                    Ordering::Equal => Pick::WalShadows,
                    Ordering::Greater => Pick::Other,
                },
            };

            let off = match pick {
                Pick::Done => {
                    self.done = true;
                    return Ok(None);
                }
                Pick::Wal => self.wal_pending.take().unwrap().1.off,
                Pick::WalShadows => {
                    self.trie_pending = None;
                    self.wal_pending.take().unwrap().1.off
                }
                Pick::Other => self.trie_pending.take().unwrap().1,
            };

            let doc = self.state.log.read_doc(off)?;
            if doc.deleted && self.flags.no_deletes {
                continue;
            }
            return Ok(Some(doc));
        }
    }
}

// merge decision of the two-way iterators.
enum Pick {
    Wal,
    WalShadows,
    Other,
    Done,
}

impl Iterator for Iter {
    type Item = Result<Doc>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_doc().transpose()
    }
}

/// Ascending seqno iterator over one store, merging the persistent
/// seq-index with the write-ahead overlay. Seqnos are disjoint between
/// the two sides.
pub struct SeqIter {
    state: Arc<FileState>,
    flags: IterFlags,
    end_seq: u64,

    seqt: Btree<SeqnoKv>,
    cursor: Cursor,
    tree_pending: Option<(u64, u64)>,
    tree_done: bool,
    wal_iter: vec::IntoIter<(u64, u64)>,
    wal_pending: Option<(u64, u64)>,
    done: bool,
}

impl SeqIter {
    pub(crate) fn new(
        state: Arc<FileState>,
        cat: StoreCat,
        part: Partition,
        start_seq: u64,
        end_seq: u64,
        flags: IterFlags,
    ) -> Result<SeqIter> {
        let seqt: Btree<SeqnoKv> = Btree::from_root(&state.blk, cat.seq_root, 8, 8)?;
        let cursor = seqt.cursor(&state.blk, Bound::Included(start_seq.to_be_bytes().to_vec()))?;

        let wal_iter = part
            .iter_seq(start_seq, end_seq)
            .map(|(_, item)| (item.seqno, item.off))
            .collect::<Vec<(u64, u64)>>()
            .into_iter();

        Ok(SeqIter {
            state,
            flags,
            end_seq,
            seqt,
            cursor,
            tree_pending: None,
            tree_done: false,
            wal_iter,
            wal_pending: None,
            done: false,
        })
    }

    fn fill_pending(&mut self) -> Result<()> {
        if self.tree_pending.is_none() && !self.tree_done {
            match self.seqt.next(&self.state.blk, &mut self.cursor)? {
                Some((key, value)) => {
                    let seqno = util::from_be_bytes(&key)?;
                    if seqno > self.end_seq {
                        self.tree_done = true;
                    } else {
                        self.tree_pending = Some((seqno, util::from_be_bytes(&value)?));
                    }
                }
                None => self.tree_done = true,
            }
        }
        if self.wal_pending.is_none() {
            self.wal_pending = self.wal_iter.next();
        }
        Ok(())
    }

    fn next_doc(&mut self) -> Result<Option<Doc>> {
        loop {
            if self.done {
                return Ok(None);
            }
            self.fill_pending()?;

            let pick = match (&self.wal_pending, &self.tree_pending) {
                (None, None) => Pick::Done,
                (Some(_), None) => Pick::Wal,
                (None, Some(_)) => Pick::Other,
                (Some((ws, _)), Some((ts, _))) if ws == ts => Pick::WalShadows,
                (Some((ws, _)), Some((ts, _))) if ws < ts => Pick::Wal,
                _ => Pick::Other,
            };

            let off = match pick {
                Pick::Done => {
                    self.done = true;
                    return Ok(None);
                }
                Pick::Wal => self.wal_pending.take().unwrap().1,
                Pick::WalShadows => {
                    self.tree_pending = None;
                    self.wal_pending.take().unwrap().1
                }
                Pick::Other => self.tree_pending.take().unwrap().1,
            };

            let doc = self.state.log.read_doc(off)?;
            if doc.deleted && self.flags.no_deletes {
                continue;
            }
            return Ok(Some(doc));
        }
    }
}

impl Iterator for SeqIter {
    type Item = Result<Doc>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_doc().transpose()
    }
}

#[cfg(test)]
#[path = "iter_test.rs"]
mod iter_test;
