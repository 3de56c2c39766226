use std::{ffi, ops::Bound, sync::Arc};

use crate::{
    bcache::NIL_BID,
    btree::{Btree, SeqnoKv},
    dlog::Doc,
    store::{
        file::{read_catalog, FileState},
        header::{CommitHeader, StoreCat},
        iter::{Iter, SeqIter},
        Db, IterFlags, INMEM_SNAPSHOT,
    },
    trie::Trie,
    util,
    wal::{Partition, WalView},
    Error, Result,
};

/// One commit marker from [Db::get_all_snap_markers]: the header's bid,
/// its timestamp and the `(store-name, seqno)` pairs it recorded.
#[derive(Clone, Debug)]
pub struct SnapMarker {
    pub bid: u64,
    pub timestamp: u64,
    pub stores: Vec<(String, u64)>,
}

/// Store statistics, from [KvsHandle::info].
#[derive(Clone, Debug)]
pub struct KvsInfo {
    pub name: String,
    pub file: ffi::OsString,
    pub doc_count: u64,
    pub last_seqnum: u64,
}

// how a handle resolves its root-set and write-ahead overlay.
#[derive(Clone)]
pub(crate) enum View {
    // current committed state plus the live committed buffer.
    Live,
    // pinned state; `wal` is the frozen overlay, if any.
    Snapshot {
        state: Arc<FileState>,
        cat: StoreCat,
        wal: Option<Arc<Partition>>,
    },
}

/// Handle onto one key-value store of a [Db] file.
///
/// Live handles observe every committed write the moment it lands;
/// snapshot handles are immutable and refuse writes.
#[derive(Clone)]
pub struct KvsHandle {
    db: Db,
    store: u64,
    name: String,
    view: View,
}

impl KvsHandle {
    pub(crate) fn new_live(db: Db, store: u64, name: &str) -> KvsHandle {
        KvsHandle { db, store, name: name.to_string(), view: View::Live }
    }

    #[inline]
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    #[inline]
    pub(crate) fn to_store_id(&self) -> u64 {
        self.store
    }

    #[inline]
    pub(crate) fn as_db(&self) -> &Db {
        &self.db
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self.view, View::Snapshot { .. })
    }

    // committed state, pinned store entry and buffer view backing a
    // read on this handle.
    pub(crate) fn read_view(&self) -> (Arc<FileState>, StoreCat, Option<Arc<Partition>>) {
        match &self.view {
            View::Live => {
                let state = self.db.inner.current_state();
                let cat = state
                    .catalog
                    .get(self.store)
                    .cloned()
                    .unwrap_or_else(|| StoreCat::new(self.store, &self.name));
                (state, cat, None)
            }
            View::Snapshot { state, cat, wal } => {
                (Arc::clone(state), cat.clone(), wal.clone())
            }
        }
    }

    // latched (state, buffer-hit) pair for a live read. taking the
    // buffer latch before resolving the state keeps the pair consistent
    // across flush and compaction publishes.
    fn live_lookup(
        &self,
        key: &[u8],
        view: WalView,
    ) -> (Arc<FileState>, Option<crate::wal::WalItem>) {
        let wal = self.db.inner.wal.read();
        let state = self.db.inner.current_state();
        let item = wal.get(self.store, key, view);
        (state, item)
    }

    fn live_lookup_byseq(
        &self,
        seqno: u64,
        view: WalView,
    ) -> (Arc<FileState>, Option<crate::wal::WalItem>) {
        let wal = self.db.inner.wal.read();
        let state = self.db.inner.current_state();
        let item = wal.get_byseq(self.store, seqno, view);
        (state, item)
    }

    fn live_cat(&self, state: &Arc<FileState>) -> StoreCat {
        state
            .catalog
            .get(self.store)
            .cloned()
            .unwrap_or_else(|| StoreCat::new(self.store, &self.name))
    }
}

impl KvsHandle {
    /// Write a document; returns its seqno.
    pub fn set(&self, key: &[u8], meta: &[u8], body: &[u8]) -> Result<u64> {
        self.check_mutable()?;
        self.db.inner.write_doc(self.store, key, meta, body, false, None)
    }

    /// Write a tombstone for `key`; returns its seqno.
    pub fn del(&self, key: &[u8], meta: &[u8]) -> Result<u64> {
        self.check_mutable()?;
        self.db.inner.write_doc(self.store, key, meta, &[], true, None)
    }

    /// Fetch the newest document for `key`. Tombstoned and absent keys
    /// report KeyNotFound.
    pub fn get(&self, key: &[u8]) -> Result<Doc> {
        match self.get_visible(key, false)? {
            doc if doc.deleted => err_at!(KeyNotFound, msg: "deleted key"),
            doc => Ok(doc),
        }
    }

    /// Fetch the document carrying `seqno`.
    pub fn get_byseq(&self, seqno: u64) -> Result<Doc> {
        match self.get_byseq_visible(seqno, false)? {
            doc if doc.deleted => err_at!(KeyNotFound, msg: "deleted seqno"),
            doc => Ok(doc),
        }
    }

    /// Like [KvsHandle::get] but skips the body and also surfaces
    /// tombstones.
    pub fn get_metaonly(&self, key: &[u8]) -> Result<Doc> {
        self.get_visible(key, true)
    }

    /// Like [KvsHandle::get_byseq] but skips the body and also surfaces
    /// tombstones.
    pub fn get_metaonly_byseq(&self, seqno: u64) -> Result<Doc> {
        self.get_byseq_visible(seqno, true)
    }

    pub(crate) fn get_visible(&self, key: &[u8], metaonly: bool) -> Result<Doc> {
        match &self.view {
            View::Live => self.get_with_view(WalView::Committed, key, metaonly),
            View::Snapshot { state, cat, wal } => {
                let item = wal.as_ref().and_then(|part| part.get(key).cloned());
                match item {
                    Some(item) => self.item_to_doc(state, item.off, metaonly, item.deleted),
                    None => self.trie_lookup(state, cat, key, metaonly),
                }
            }
        }
    }

    // shared lookup against an explicit buffer view, for live and
    // transactional reads.
    pub(crate) fn get_with_view(&self, view: WalView, key: &[u8], metaonly: bool) -> Result<Doc> {
        let (state, item) = self.live_lookup(key, view);
        match item {
            Some(item) => self.item_to_doc(&state, item.off, metaonly, item.deleted),
            None => {
                let cat = self.live_cat(&state);
                self.trie_lookup(&state, &cat, key, metaonly)
            }
        }
    }

    fn trie_lookup(
        &self,
        state: &Arc<FileState>,
        cat: &StoreCat,
        key: &[u8],
        metaonly: bool,
    ) -> Result<Doc> {
        let trie = Trie::from_root(cat.trie_root, self.db.inner.config.chunksize);
        match trie.get(&state.blk, &state.log, key)? {
            Some(off) => self.item_to_doc(state, off, metaonly, false),
            None => err_at!(KeyNotFound, msg: "no such key"),
        }
    }

    fn item_to_doc(
        &self,
        state: &Arc<FileState>,
        off: u64,
        metaonly: bool,
        _deleted: bool,
    ) -> Result<Doc> {
        match metaonly {
            true => state.log.read_doc_meta(off),
            false => state.log.read_doc(off),
        }
    }

    pub(crate) fn get_byseq_visible(&self, seqno: u64, metaonly: bool) -> Result<Doc> {
        let (state, cat, item) = match &self.view {
            View::Live => {
                let (state, item) = self.live_lookup_byseq(seqno, WalView::Committed);
                let cat = self.live_cat(&state);
                (state, cat, item)
            }
            View::Snapshot { state, cat, wal } => {
                let item = wal.as_ref().and_then(|part| part.get_byseq(seqno).cloned());
                (Arc::clone(state), cat.clone(), item)
            }
        };

        if let Some(item) = item {
            return self.item_to_doc(&state, item.off, metaonly, item.deleted);
        }

        let seqt: Btree<SeqnoKv> = Btree::from_root(&state.blk, cat.seq_root, 8, 8)?;
        match seqt.find(&state.blk, &seqno.to_be_bytes())? {
            Some(value) => {
                let off = util::from_be_bytes(&value)?;
                self.item_to_doc(&state, off, metaonly, false)
            }
            None => err_at!(KeyNotFound, msg: "no such seqno {}", seqno),
        }
    }

    fn check_mutable(&self) -> Result<()> {
        match self.view {
            View::Live => Ok(()),
            View::Snapshot { .. } => {
                err_at!(RonlyViolation, msg: "snapshot handles are read-only")
            }
        }
    }
}

impl KvsHandle {
    /// Open a read-only snapshot of this store.
    ///
    /// * seqno `0` pins an empty view; iterators yield nothing.
    /// * [INMEM_SNAPSHOT] freezes the current in-memory state, committed
    ///   or not yet flushed; later writes never leak in.
    /// * any other seqno walks the header back-chain for the commit
    ///   whose last-seqno equals it, reporting NoDbInstance otherwise.
    pub fn snapshot(&self, seqno: u64) -> Result<KvsHandle> {
        if self.is_snapshot() {
            err_at!(InvalidInput, msg: "snapshot of a snapshot, clone it instead")?
        }
        let inner = &self.db.inner;
        let state = inner.current_state();

        let view = if seqno == 0 {
            let mut cat = StoreCat::new(self.store, &self.name);
            cat.trie_root = NIL_BID;
            cat.seq_root = NIL_BID;
            View::Snapshot { state, cat, wal: None }
        } else if seqno == INMEM_SNAPSHOT {
            // freeze the buffer and the state as one latched pair.
            let wal = inner.wal.read();
            let state = inner.current_state();
            let part = wal.snapshot_committed(self.store);
            let last_seqno = wal.committed_seqno(self.store);
            drop(wal);

            let mut cat = self.live_cat(&state);
            cat.last_seqno = last_seqno;
            View::Snapshot { state, cat, wal: Some(Arc::new(part)) }
        } else {
            let (hstate, cat, part) = self.pin_committed(&state, seqno)?;
            View::Snapshot { state: hstate, cat, wal: Some(Arc::new(part)) }
        };

        Ok(KvsHandle {
            db: self.db.clone(),
            store: self.store,
            name: self.name.clone(),
            view,
        })
    }

    // walk the header back-chain for the commit whose last-seqno for
    // this store equals `seqno`, and rebuild its unflushed buffer
    // overlay from the log.
    fn pin_committed(
        &self,
        state: &Arc<FileState>,
        seqno: u64,
    ) -> Result<(Arc<FileState>, StoreCat, Partition)> {
        if state.header_bid == NIL_BID {
            err_at!(NoDbInstance, msg: "no commit at seqno {}", seqno)?
        }
        let (mut bid, mut header) = (state.header_bid, state.header.clone());

        loop {
            let catalog = read_catalog(&state.log, header.catalog_off)?;
            match catalog.get(self.store) {
                Some(st) if st.last_seqno == seqno => {
                    let part = self.overlay_at(state, bid, &header, st)?;
                    return Ok((Arc::clone(state), st.clone(), part));
                }
                Some(st) if st.last_seqno < seqno => {
                    // older headers only recede further.
                    err_at!(NoDbInstance, msg: "no commit at seqno {}", seqno)?
                }
                _ => (),
            }
            if header.prev_bid == NIL_BID {
                err_at!(NoDbInstance, msg: "no commit at seqno {}", seqno)?
            }
            bid = header.prev_bid;
            header = CommitHeader::decode_block(&state.blk.read(header.prev_bid)?)?;
        }
    }

    // committed documents of this store that were still buffered when
    // `header` was written.
    fn overlay_at(
        &self,
        state: &Arc<FileState>,
        header_bid: u64,
        header: &CommitHeader,
        st: &StoreCat,
    ) -> Result<Partition> {
        use std::convert::TryFrom;

        use crate::store::file::scan_unflushed;

        let mut part = Partition::default();
        let to = header_bid * u64::try_from(state.blk.to_blocksize()).unwrap();
        for (off, doc, size) in scan_unflushed(&state.log, header.wal_scan_start, to)? {
            if doc.store != st.id || doc.seqno > st.last_seqno {
                continue;
            }
            let item = crate::wal::WalItem {
                off,
                seqno: doc.seqno,
                deleted: doc.deleted,
                size,
            };
            part.put(doc.key, item);
        }
        Ok(part)
    }

    /// Truncate this store's history to `seqno`; refer to module
    /// documentation for the exact rules.
    pub fn rollback(&self, seqno: u64) -> Result<()> {
        self.check_mutable()?;
        self.db.inner.rollback(self.store, seqno)
    }

    /// Store statistics. For snapshot handles `last_seqnum` reports the
    /// pinned seqno.
    pub fn info(&self) -> Result<KvsInfo> {
        let (state, cat, _) = self.read_view();
        let last_seqnum = match &self.view {
            View::Live => self.db.inner.wal.read().committed_seqno(self.store),
            View::Snapshot { cat, .. } => cat.last_seqno,
        };
        Ok(KvsInfo {
            name: self.name.clone(),
            file: state.path.clone(),
            doc_count: cat.doc_count,
            last_seqnum,
        })
    }
}

impl KvsHandle {
    // frozen (state, store-entry, overlay) triple an iterator runs off.
    fn iter_view(&self) -> (Arc<FileState>, StoreCat, Partition) {
        match &self.view {
            View::Live => {
                let wal = self.db.inner.wal.read();
                let state = self.db.inner.current_state();
                let part = wal.snapshot_committed(self.store);
                drop(wal);
                let cat = self.live_cat(&state);
                (state, cat, part)
            }
            View::Snapshot { state, cat, wal } => {
                let part = wal.as_ref().map(|p| (**p).clone()).unwrap_or_default();
                (Arc::clone(state), cat.clone(), part)
            }
        }
    }

    /// Ordered iterator over `[start, end]` in ascending key order.
    pub fn iter(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        flags: IterFlags,
    ) -> Result<Iter> {
        let (state, cat, part) = self.iter_view();

        let start = match start {
            Some(key) => Bound::Included(key.to_vec()),
            None => Bound::Unbounded,
        };
        let end = match end {
            Some(key) => Bound::Included(key.to_vec()),
            None => Bound::Unbounded,
        };

        Iter::new(state, cat, part, self.db.inner.config.chunksize, start, end, flags)
    }

    /// Iterator over seqnos within `[start_seq, end_seq]`, ascending;
    /// zero bounds mean unbounded.
    pub fn iter_seq(&self, start_seq: u64, end_seq: u64, flags: IterFlags) -> Result<SeqIter> {
        let (state, cat, part) = self.iter_view();

        let end_seq = match end_seq {
            0 => u64::MAX,
            n => n,
        };
        // a pinned view never reveals seqnos past its pin.
        let end_seq = match &self.view {
            View::Snapshot { cat, .. } => u64::min(end_seq, cat.last_seqno),
            View::Live => end_seq,
        };

        SeqIter::new(state, cat, part, u64::max(start_seq, 1), end_seq, flags)
    }
}

#[cfg(test)]
#[path = "kvs_test.rs"]
mod kvs_test;
