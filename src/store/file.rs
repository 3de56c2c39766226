use log::{debug, info, warn};

use std::{
    convert::TryFrom,
    ffi,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::SeqCst},
        Arc, Mutex,
    },
};

use crate::{
    bcache::{BlockFile, MARKER_HEADER, NIL_BID},
    btree::{Btree, SeqnoKv},
    dlog::{Doc, DocLog, MAX_KEYLEN, REC_CATALOG, REC_DOC},
    store::{
        compact,
        header::{Catalog, CommitHeader, StoreCat},
        kvs::KvsHandle,
        txn::Transaction,
        CommitMode, CompactionMode, Config, IsolationLevel, DEFAULT_STORE,
    },
    trie::Trie,
    util,
    util::{Spinlock, Thread},
    wal::{Wal, WalItem},
    Error, Result,
};

/// Immutable, RCU-published view of a committed file. Readers clone the
/// [Arc] and keep a consistent root-set for as long as they hold it.
pub(crate) struct FileState {
    pub path: ffi::OsString,
    pub blk: Arc<BlockFile>,
    pub log: Arc<DocLog>,
    pub header_bid: u64,
    pub header: CommitHeader,
    pub catalog: Catalog,
    // bumped by every compaction.
    pub revision: u64,
}

pub(crate) struct Inner {
    pub config: Config,
    // original open location; compaction swaps keep writing here.
    pub path: ffi::OsString,
    // committed state, swapped wholesale on commit/rollback/compaction.
    pub state: Spinlock<Arc<FileState>>,
    // runtime catalog, running ahead of the committed one.
    pub catalog: Spinlock<Catalog>,
    pub wal: Spinlock<Wal>,
    // file-level mutex serializing writers, commits, rollback and the
    // compaction swap.
    pub writer: Mutex<()>,
    pub txn_ids: AtomicU64,
    pub compacting: AtomicBool,
    pub daemon: Mutex<Option<Thread<compact::Tick, Result<()>>>>,
}

/// Handle to an open database file.
///
/// Cloning is cheap and clones operate on the same underlying file; the
/// last clone going out of scope closes it.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<Inner>,
}

impl Db {
    /// Open the file at `path`. With [Config::create] a missing file is
    /// created and seeded with an empty commit; an existing file is
    /// recovered by scanning backward for its newest valid commit
    /// header, anything beyond it is discarded as torn tail.
    pub fn open(path: &ffi::OsStr, config: Config) -> Result<Db> {
        config.validate()?;

        let blk = Arc::new(BlockFile::open(
            path,
            config.blocksize,
            config.buffercache_size,
            config.create,
        )?);
        let log = Arc::new(DocLog::new(Arc::clone(&blk)));

        let (header_bid, header, catalog) = if blk.num_blocks() == 0 {
            // virgin file: no commits yet, the chain starts empty.
            (NIL_BID, CommitHeader::initial(), Catalog::default())
        } else {
            Self::recover(&blk, &log)?
        };

        let mut wal = Wal::new();
        Self::restore_wal(&blk, &log, &header, &catalog, &mut wal)?;
        blk.publish();

        let state = FileState {
            path: path.to_os_string(),
            blk,
            log,
            header_bid,
            header,
            catalog: catalog.clone(),
            revision: 0,
        };

        let inner = Arc::new(Inner {
            config: config.clone(),
            path: path.to_os_string(),
            state: Spinlock::new(Arc::new(state)),
            catalog: Spinlock::new(catalog),
            wal: Spinlock::new(wal),
            writer: Mutex::new(()),
            txn_ids: AtomicU64::new(0),
            compacting: AtomicBool::new(false),
            daemon: Mutex::new(None),
        });

        if config.compaction_mode == CompactionMode::Auto {
            let th = compact::start_daemon(&inner);
            *inner.daemon.lock().unwrap() = Some(th);
        }

        info!(target: "banyan", "open {:?} header at bid {}", path, header_bid);
        Ok(Db { inner })
    }

    // scan the file backward, one block at a time, for the newest header
    // that passes marker, crc, magic, chain and catalog validation.
    // everything beyond it is truncated away.
    fn recover(blk: &Arc<BlockFile>, log: &Arc<DocLog>) -> Result<(u64, CommitHeader, Catalog)> {
        let n = blk.num_blocks();
        for bid in (0..n).rev() {
            let data = match blk.read(bid) {
                Ok(data) => data,
                Err(_) => continue,
            };
            if data[0] != MARKER_HEADER {
                continue;
            }
            let header = match CommitHeader::decode_block(&data) {
                Ok(header) => header,
                Err(err) => {
                    warn!(target: "banyan", "skipping header candidate {}: {}", bid, err);
                    continue;
                }
            };
            if header.prev_bid != NIL_BID && header.prev_bid >= bid {
                warn!(target: "banyan", "skipping header {}: bad chain {}", bid, header.prev_bid);
                continue;
            }
            let catalog = match read_catalog(log, header.catalog_off) {
                Ok(catalog) => catalog,
                Err(err) => {
                    warn!(target: "banyan", "skipping header {}: {}", bid, err);
                    continue;
                }
            };

            if (bid + 1) < n {
                debug!(target: "banyan", "dropping torn tail beyond bid {}", bid);
            }
            blk.truncate_blocks(bid + 1)?;
            return Ok((bid, header, catalog));
        }

        err_at!(FileCorruption, msg: "no valid commit header")
    }

    // re-read committed documents that never made it into the trees and
    // reload them into the write-ahead-buffer.
    fn restore_wal(
        blk: &Arc<BlockFile>,
        log: &Arc<DocLog>,
        header: &CommitHeader,
        catalog: &Catalog,
        wal: &mut Wal,
    ) -> Result<()> {
        for st in catalog.stores.iter() {
            wal.reset_seqno(st.id, st.last_seqno);
        }

        let to = blk.num_blocks() * u64::try_from(blk.to_blocksize()).unwrap();
        let mut restored = 0;
        for entry in scan_unflushed(log, header.wal_scan_start, to)? {
            let (off, doc, size) = entry;
            let st = match catalog.get(doc.store) {
                Some(st) => st,
                None => continue,
            };
            if doc.seqno > st.last_seqno {
                // beyond the last commit, not recoverable.
                continue;
            }
            let item = WalItem { off, seqno: doc.seqno, deleted: doc.deleted, size };
            wal.put(st.id, doc.key, item, None);
            restored += 1;
        }

        if restored > 0 {
            debug!(target: "banyan", "restored {} write-ahead entries", restored);
        }
        Ok(())
    }
}

/// Scan `[from, to)` of the log for recoverable documents: plain writes,
/// and transactional writes whose commit-mark made it into the range.
/// Returned in log order as `(offset, doc, size)`.
pub(crate) fn scan_unflushed(
    log: &DocLog,
    from: u64,
    to: u64,
) -> Result<Vec<(u64, Doc, usize)>> {
    use std::collections::HashSet;

    let mut marks: HashSet<u64> = HashSet::new();
    let mut docs: Vec<(u64, Doc, usize)> = vec![];

    for rec in log.scan(from, to) {
        let (off, kind, payload) = rec?;
        match kind {
            REC_DOC => {
                let (doc, _) = util::from_cbor_bytes::<Doc>(&payload)?;
                docs.push((off, doc, 9 + payload.len()));
            }
            crate::dlog::REC_TXN_MARK => {
                let (mark, _) = util::from_cbor_bytes::<crate::dlog::TxnMark>(&payload)?;
                marks.insert(mark.id);
            }
            _ => (),
        }
    }

    docs.retain(|(_, doc, _)| doc.txn == 0 || marks.contains(&doc.txn));
    Ok(docs)
}

impl Db {
    /// Open the store `name`, creating it on first use; the empty name
    /// denotes the default store. Store creation becomes durable with
    /// the next commit.
    pub fn open_store(&self, name: &str) -> Result<KvsHandle> {
        let name = if name.is_empty() { DEFAULT_STORE } else { name };
        if !self.inner.config.multi_kv_instances && name != DEFAULT_STORE {
            err_at!(InvalidInput, msg: "single store file, no {:?}", name)?
        }

        let id = {
            let mut catalog = self.inner.catalog.write();
            match catalog.by_name(name) {
                Some(st) => st.id,
                None => {
                    let id = catalog.add(name);
                    self.inner.wal.write().reset_seqno(id, 0);
                    id
                }
            }
        };

        Ok(KvsHandle::new_live(self.clone(), id, name))
    }

    /// Commit the file's current state; refer to [CommitMode].
    pub fn commit(&self, mode: CommitMode) -> Result<()> {
        let _w = self.inner.writer.lock().unwrap();
        self.inner.commit_locked(mode)
    }

    /// Begin a transaction; refer to [Transaction].
    pub fn begin_transaction(&self, isolation: IsolationLevel) -> Result<Transaction> {
        let id = self.inner.txn_ids.fetch_add(1, SeqCst) + 1;
        self.inner.wal.write().begin_txn(id);
        // register first, check second; the compactor does the opposite,
        // so one of the two always observes the other.
        if self.inner.compacting.load(SeqCst) {
            self.inner.wal.write().abort_txn(id);
            err_at!(FailByCompaction, msg: "transactions wait for compaction")?
        }
        Ok(Transaction::new(self.clone(), id, isolation))
    }

    /// Copy the live document set into a fresh file at `new_path` and
    /// atomically swap to it; refer to module documentation.
    pub fn compact(&self, new_path: &ffi::OsStr) -> Result<()> {
        self.inner.compact(new_path)
    }

    /// One marker per commit in the header back-chain, newest first,
    /// with the per-store seqnos recorded by that commit.
    pub fn get_all_snap_markers(&self) -> Result<Vec<crate::store::SnapMarker>> {
        let state = self.inner.current_state();
        let mut markers = vec![];
        if state.header_bid == NIL_BID {
            return Ok(markers);
        }

        let (mut bid, mut header) = (state.header_bid, state.header.clone());
        loop {
            let catalog = read_catalog(&state.log, header.catalog_off)?;
            markers.push(crate::store::SnapMarker {
                bid,
                timestamp: header.timestamp,
                stores: catalog
                    .stores
                    .iter()
                    .map(|st| (st.name.clone(), st.last_seqno))
                    .collect(),
            });
            if header.prev_bid == NIL_BID {
                break;
            }
            bid = header.prev_bid;
            header = CommitHeader::decode_block(&state.blk.read(header.prev_bid)?)?;
        }
        Ok(markers)
    }

    /// Snapshot of file-wide statistics.
    pub fn info(&self) -> Result<DbInfo> {
        let state = self.inner.current_state();
        let catalog = self.inner.catalog.read().clone();
        let lock_conflicts = self.inner.state.to_conflicts()
            + self.inner.catalog.to_conflicts()
            + self.inner.wal.to_conflicts();
        Ok(DbInfo {
            path: state.path.clone(),
            file_size: state.blk.to_file_size(),
            num_blocks: state.blk.num_blocks(),
            doc_count: catalog.stores.iter().map(|st| st.doc_count).sum(),
            active_bytes: catalog.stores.iter().map(|st| st.active_bytes).sum(),
            lock_conflicts,
            stores: catalog.stores.iter().map(|st| st.name.clone()).collect(),
        })
    }

    /// Close this handle. The file closes with its last handle; nothing
    /// uncommitted survives.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

/// File-wide statistics, from [Db::info].
#[derive(Clone, Debug)]
pub struct DbInfo {
    pub path: ffi::OsString,
    pub file_size: u64,
    pub num_blocks: u64,
    pub doc_count: u64,
    pub active_bytes: u64,
    /// Spin-latch contention across the engine's shared state, since
    /// open.
    pub lock_conflicts: u64,
    pub stores: Vec<String>,
}

impl Inner {
    pub(crate) fn current_state(&self) -> Arc<FileState> {
        Arc::clone(&self.state.read())
    }

    // write path for set/del, transactional or not. appends the document
    // to the log and indexes it in the write-ahead-buffer.
    pub(crate) fn write_doc(
        &self,
        store: u64,
        key: &[u8],
        meta: &[u8],
        body: &[u8],
        deleted: bool,
        txn: Option<u64>,
    ) -> Result<u64> {
        if key.is_empty() || key.len() > MAX_KEYLEN {
            err_at!(InvalidInput, msg: "key length {}", key.len())?
        }

        let _w = self.writer.lock().unwrap();
        let state = self.current_state();

        let seqno = self.wal.write().alloc_seqno(store);
        let mut doc = match deleted {
            true => Doc::new_del(store, key.to_vec(), meta.to_vec(), seqno),
            false => Doc::new_set(store, key.to_vec(), meta.to_vec(), body.to_vec(), seqno),
        };
        doc.txn = txn.unwrap_or(0);

        let off = state.log.append_doc(&doc)?;
        let size = state.log.rec_size(off)?;
        let item = WalItem { off, seqno, deleted, size };
        self.wal.write().put(store, key.to_vec(), item, txn);

        Ok(seqno)
    }

    // commit with the writer mutex already held.
    pub(crate) fn commit_locked(&self, mode: CommitMode) -> Result<()> {
        let state = self.current_state();

        let flush = mode == CommitMode::ManualWalFlush
            || self.wal.read().committed_entries() >= self.config.wal_threshold;

        let mut catalog = self.catalog.read().clone();
        let (flushed, base) = if flush {
            let flushed = self.flush_wal(&state, &mut catalog)?;
            (flushed, state.log.tail_offset())
        } else {
            (vec![], state.header.wal_scan_start)
        };
        // the scan start may never pass a document still buffered in any
        // partition; transactional writes can predate the flush point.
        // entries applied by the flush above are on their way out and do
        // not count.
        let wal_scan_start = {
            let wal = self.wal.read();
            let floor = match flush {
                true => wal.min_txn_offset(),
                false => wal.min_unflushed_offset(),
            };
            match floor {
                Some(off) => u64::min(base, off),
                None => base,
            }
        };

        for st in catalog.stores.iter_mut() {
            st.last_seqno = self.wal.read().committed_seqno(st.id);
        }

        let catalog_off =
            state.log.append(REC_CATALOG, &util::into_cbor_bytes(catalog.clone())?)?;

        let header = CommitHeader::new(state.header_bid, wal_scan_start, catalog_off);
        let header_bid = state.blk.alloc(MARKER_HEADER)?;
        state.blk.write(header_bid, header.encode_block(state.blk.to_blocksize())?)?;
        state.blk.flush()?;
        state.blk.sync()?;

        // nothing is visible to future opens until the fsync above; now
        // publish the new root-set to live readers. the state swap and
        // the discard of flushed buffer entries happen under the buffer
        // latch, so readers always observe a consistent pair.
        let nstate = FileState {
            path: state.path.clone(),
            blk: Arc::clone(&state.blk),
            log: Arc::clone(&state.log),
            header_bid,
            header,
            catalog: catalog.clone(),
            revision: state.revision,
        };
        {
            let mut wal = self.wal.write();
            *self.state.write() = Arc::new(nstate);
            for sid in flushed.into_iter() {
                wal.drain_committed(sid);
            }
        }
        state.blk.publish();

        {
            let mut live = self.catalog.write();
            for st in catalog.stores.iter() {
                if let Some(cur) = live.get_mut(st.id) {
                    *cur = st.clone();
                }
            }
        }

        debug!(
            target: "banyan",
            "commit {:?} bid {} flush:{}", mode, header_bid, flush
        );

        compact::nudge(self);
        Ok(())
    }

    // apply every committed write-ahead entry onto the trees, store by
    // store in key order, and update the catalog's roots and counters.
    // deterministic: (old roots, ordered entries) -> new roots. entries
    // stay in the buffer until the new roots are published; the returned
    // store ids are discarded right after the publish.
    fn flush_wal(&self, state: &FileState, catalog: &mut Catalog) -> Result<Vec<u64>> {
        let dirty = self.wal.read().dirty_stores();
        for sid in dirty.iter().copied() {
            if catalog.get(sid).is_none() {
                // store created after the catalog clone was taken.
                match self.catalog.read().get(sid) {
                    Some(st) => catalog.stores.push(st.clone()),
                    None => continue,
                }
            }
            let st = catalog.get_mut(sid).unwrap();

            let entries: Vec<(Vec<u8>, WalItem)> = {
                let part = self.wal.read().snapshot_committed(sid);
                part.iter().map(|(k, item)| (k.clone(), item.clone())).collect()
            };
            let mut trie = Trie::from_root(st.trie_root, self.config.chunksize);
            let mut seqt: Btree<SeqnoKv> = Btree::from_root(&state.blk, st.seq_root, 8, 8)?;

            let n = entries.len();
            for (key, item) in entries.into_iter() {
                apply_indexed(&state.blk, &state.log, &mut trie, &mut seqt, st, &key, &item)?;
            }

            st.trie_root = trie.to_root();
            st.seq_root = seqt.to_root();
            debug!(target: "banyan", "flushed {} entries into store {}", n, sid);
        }
        Ok(dirty)
    }

    /// Truncate `store`'s logical history to `seqno` by adopting the
    /// newest header at-or-below it and committing that choice.
    pub(crate) fn rollback(&self, store: u64, seqno: u64) -> Result<()> {
        if seqno == 0 || seqno == crate::store::INMEM_SNAPSHOT {
            err_at!(InvalidInput, msg: "rollback to seqno {}", seqno)?
        }
        if self.compacting.load(SeqCst) {
            err_at!(FailByCompaction, msg: "rollback during compaction")?
        }

        let _w = self.writer.lock().unwrap();
        if self.wal.read().live_txns() > 0 {
            err_at!(FailByTransaction, msg: "rollback with live transactions")?
        }
        if seqno > self.wal.read().committed_seqno(store) {
            err_at!(NoDbInstance, msg: "rollback target {} in the future", seqno)?
        }

        // settle everything into the trees first, so adopting older
        // roots is a pure root swap.
        self.commit_locked(CommitMode::ManualWalFlush)?;

        let state = self.current_state();
        let (mut header, mut adopted) = (state.header.clone(), None);
        loop {
            let catalog = read_catalog(&state.log, header.catalog_off)?;
            match catalog.get(store) {
                Some(st) if st.last_seqno <= seqno => {
                    adopted = Some(st.clone());
                    break;
                }
                Some(_) => (),
                None => break,
            }
            if header.prev_bid == NIL_BID {
                break;
            }
            header = CommitHeader::decode_block(&state.blk.read(header.prev_bid)?)?;
        }

        let adopted = match adopted {
            Some(st) => st,
            None => err_at!(NoDbInstance, msg: "no header at-or-below seqno {}", seqno)?,
        };

        {
            let mut live = self.catalog.write();
            match live.get_mut(store) {
                Some(cur) => {
                    cur.trie_root = adopted.trie_root;
                    cur.seq_root = adopted.seq_root;
                    cur.last_seqno = adopted.last_seqno;
                    cur.doc_count = adopted.doc_count;
                    cur.active_bytes = adopted.active_bytes;
                }
                None => err_at!(NoDbInstance, msg: "unknown store {}", store)?,
            }
        }
        self.wal.write().reset_seqno(store, adopted.last_seqno);

        self.commit_locked(CommitMode::Normal)?;
        info!(
            target: "banyan",
            "store {} rolled back to seqno {}", store, adopted.last_seqno
        );
        Ok(())
    }
}

impl Inner {
    // stale fraction of the file, in percent.
    pub(crate) fn stale_percent(&self) -> u64 {
        let state = self.current_state();
        let total = state.blk.to_file_size();
        if total == 0 {
            return 0;
        }
        let active: u64 = self.catalog.read().stores.iter().map(|st| st.active_bytes).sum();
        100_u64.saturating_sub((active * 100) / total)
    }
}

/// Read back a catalog record from the document-log.
pub(crate) fn read_catalog(log: &DocLog, off: u64) -> Result<Catalog> {
    match log.read(off)? {
        (REC_CATALOG, payload) => Ok(util::from_cbor_bytes::<Catalog>(&payload)?.0),
        (kind, _) => err_at!(FileCorruption, msg: "expected catalog at {}, kind {}", off, kind),
    }
}

// index one write: upsert the trie, retire the shadowed seqno, add the
// new one, and track counters. shared by the flush path and compaction's
// delta replay.
pub(crate) fn apply_indexed(
    blk: &BlockFile,
    log: &DocLog,
    trie: &mut Trie,
    seqt: &mut Btree<SeqnoKv>,
    st: &mut StoreCat,
    key: &[u8],
    item: &WalItem,
) -> Result<()> {
    let old = trie.insert(blk, log, key, item.off)?;

    match old {
        Some(old_off) => {
            let odoc = log.read_doc_meta(old_off)?;
            seqt.remove(blk, &odoc.seqno.to_be_bytes())?;
            let osize = u64::try_from(log.rec_size(old_off)?).unwrap();
            st.active_bytes = st.active_bytes.saturating_sub(osize);
            match (odoc.deleted, item.deleted) {
                (false, true) => st.doc_count = st.doc_count.saturating_sub(1),
                (true, false) => st.doc_count += 1,
                _ => (),
            }
        }
        None if !item.deleted => st.doc_count += 1,
        None => (),
    }

    seqt.insert(blk, &item.seqno.to_be_bytes(), &item.off.to_be_bytes())?;
    st.active_bytes += u64::try_from(item.size).unwrap();
    Ok(())
}

impl Drop for Inner {
    fn drop(&mut self) {
        // the daemon holds only a weak reference, so disconnecting its
        // channel is enough for the loop to wind down.
        if let Some(th) = self.daemon.lock().unwrap().take() {
            th.close_wait().ok();
        }
    }
}

#[cfg(test)]
#[path = "file_test.rs"]
mod file_test;
