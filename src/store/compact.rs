use log::{info, warn};

use std::{
    collections::{BTreeMap, HashMap},
    convert::TryFrom,
    ffi, fs,
    ops::Bound,
    sync::{atomic::Ordering::SeqCst, mpsc, Arc, Weak},
    time,
};

use crate::{
    bcache::{BlockFile, MARKER_HEADER, NIL_BID},
    btree::{Btree, SeqnoKv},
    dlog::DocLog,
    store::{
        file::{apply_indexed, read_catalog, FileState, Inner},
        header::{Catalog, CommitHeader, StoreCat},
        unix_now, CommitMode, CompactionMode,
    },
    trie::Trie,
    util::{self, Thread},
    wal::WalItem,
    Error, Result,
};

// entries per catch-up round below which the compactor grabs the writer
// lock and finishes.
const DELTA_SETTLED: usize = 64;
// bound on lock-free catch-up rounds.
const DELTA_ROUNDS: usize = 4;
// files smaller than this many blocks are not worth auto-compacting.
const AUTO_MIN_BLOCKS: u64 = 64;

/// Wake-up message for the auto-compaction daemon.
pub(crate) enum Tick {
    Check,
}

impl Inner {
    /// Online compaction: copy every live document at the committed head
    /// into a fresh file at `new_path`, replay commits that landed while
    /// copying, then atomically swap. Readers holding older roots keep
    /// the old file alive until they let go.
    pub(crate) fn compact(&self, new_path: &ffi::OsStr) -> Result<()> {
        if self.compacting.swap(true, SeqCst) {
            return err_at!(FailByCompaction, msg: "compaction already running");
        }
        let res = self.compact_inner(new_path);
        self.compacting.store(false, SeqCst);
        res
    }

    fn compact_inner(&self, new_path: &ffi::OsStr) -> Result<()> {
        if self.wal.read().live_txns() > 0 {
            err_at!(FailByTransaction, msg: "compaction with live transactions")?
        }

        // settle the buffer into the trees; the bulk copy then runs off
        // a fully indexed, frozen root-set.
        {
            let _w = self.writer.lock().unwrap();
            self.commit_locked(CommitMode::ManualWalFlush)?;
        }
        let start = self.current_state();
        let barriers = self.purge_barriers(&start)?;

        let tmp = tmp_location(new_path);
        fs::remove_file(&tmp).ok();
        let nblk = Arc::new(BlockFile::open(
            &tmp,
            self.config.blocksize,
            self.config.buffercache_size,
            true,
        )?);
        let nlog = Arc::new(DocLog::new(Arc::clone(&nblk)));

        let mut ncat = Catalog { next_id: start.catalog.next_id, stores: vec![] };
        let mut applied: HashMap<u64, u64> = HashMap::new();

        for st in start.catalog.stores.iter() {
            let nst = self.copy_store(&start, st, &nblk, &nlog, &barriers)?;
            applied.insert(st.id, st.last_seqno);
            ncat.stores.push(nst);
        }

        // catch up with writers without blocking them.
        for _round in 0..DELTA_ROUNDS {
            let n = self.replay_delta(&nblk, &nlog, &mut ncat, &mut applied, &barriers)?;
            if n < DELTA_SETTLED {
                break;
            }
        }

        // block writers for the final delta and the swap.
        let _w = self.writer.lock().unwrap();
        {
            // pick up stores created while the copy was running.
            let live = self.catalog.read().clone();
            ncat.next_id = live.next_id;
            for st in live.stores.iter() {
                if ncat.get(st.id).is_none() {
                    ncat.stores.push(StoreCat::new(st.id, &st.name));
                    applied.insert(st.id, 0);
                }
            }
        }
        self.replay_delta(&nblk, &nlog, &mut ncat, &mut applied, &barriers)?;
        for st in ncat.stores.iter_mut() {
            st.last_seqno = applied[&st.id];
        }

        let catalog_off =
            nlog.append(crate::dlog::REC_CATALOG, &util::into_cbor_bytes(ncat.clone())?)?;
        let header = CommitHeader::new(NIL_BID, nlog.tail_offset(), catalog_off);
        let header_bid = nblk.alloc(MARKER_HEADER)?;
        nblk.write(header_bid, header.encode_block(nblk.to_blocksize())?)?;
        nblk.flush()?;
        nblk.sync()?;

        err_at!(IOError, fs::rename(&tmp, new_path), "compaction swap")?;
        if start.path.as_os_str() != new_path {
            // compacting onto the same path already unlinked the old
            // file through the rename.
            fs::remove_file(&start.path).ok();
        }
        nblk.publish();

        let nstate = FileState {
            path: new_path.to_os_string(),
            blk: nblk,
            log: nlog,
            header_bid,
            header,
            catalog: ncat.clone(),
            revision: start.revision + 1,
        };
        {
            // replayed entries are fully indexed in the new file; swap
            // and discard as one step, under the buffer latch, so
            // readers never pair the new file with stale offsets.
            let mut wal = self.wal.write();
            *self.state.write() = Arc::new(nstate);
            wal.clear_committed();
        }

        {
            let mut live = self.catalog.write();
            for st in ncat.stores.iter() {
                if let Some(cur) = live.get_mut(st.id) {
                    *cur = st.clone();
                }
            }
        }

        info!(
            target: "banyan",
            "compacted {:?} -> {:?}, revision {}", start.path, new_path, start.revision + 1
        );
        Ok(())
    }

    // bulk copy of one store's live documents at the frozen start state.
    fn copy_store(
        &self,
        start: &Arc<FileState>,
        st: &StoreCat,
        nblk: &Arc<BlockFile>,
        nlog: &Arc<DocLog>,
        barriers: &HashMap<u64, u64>,
    ) -> Result<StoreCat> {
        let cs = self.config.chunksize;
        let barrier = barriers.get(&st.id).copied().unwrap_or(0);

        let mut nst = StoreCat::new(st.id, &st.name);
        nst.last_seqno = st.last_seqno;
        let mut trie = Trie::new(cs);
        let mut seqt: Btree<SeqnoKv> = Btree::new(8, 8);

        let mut iter = Trie::from_root(st.trie_root, cs).iter(
            Arc::clone(&start.blk),
            Arc::clone(&start.log),
            Bound::Unbounded,
        )?;

        let (mut copied, mut purged) = (0, 0);
        while let Some((_, off)) = iter.next_entry()? {
            let doc = start.log.read_doc(off)?;
            if doc.deleted && doc.seqno < barrier {
                purged += 1;
                continue;
            }
            let noff = nlog.append_doc(&doc)?;
            trie.insert(nblk, nlog, &doc.key, noff)?;
            seqt.insert(nblk, &doc.seqno.to_be_bytes(), &noff.to_be_bytes())?;
            if !doc.deleted {
                nst.doc_count += 1;
            }
            nst.active_bytes += u64::try_from(nlog.rec_size(noff)?).unwrap();
            copied += 1;
        }

        nst.trie_root = trie.to_root();
        nst.seq_root = seqt.to_root();
        info!(
            target: "banyan",
            "compaction copied {} and purged {} records of store {}", copied, purged, st.id
        );
        Ok(nst)
    }

    // replay commits made after the seqnos in `applied` into the new
    // file, preserving seqnos. returns the number of replayed entries.
    fn replay_delta(
        &self,
        nblk: &Arc<BlockFile>,
        nlog: &Arc<DocLog>,
        ncat: &mut Catalog,
        applied: &mut HashMap<u64, u64>,
        barriers: &HashMap<u64, u64>,
    ) -> Result<usize> {
        let cs = self.config.chunksize;
        let cur = self.current_state();

        let mut total = 0;
        for st in ncat.stores.iter_mut() {
            let from = applied[&st.id] + 1;
            let to = self.wal.read().committed_seqno(st.id);
            if to < from {
                continue;
            }

            // deltas live in the current seq-index and, when not yet
            // flushed, in the committed write-ahead partition.
            let mut items: BTreeMap<u64, u64> = BTreeMap::new();
            if let Some(cst) = cur.catalog.get(st.id) {
                let seqt: Btree<SeqnoKv> = Btree::from_root(&cur.blk, cst.seq_root, 8, 8)?;
                let mut cursor =
                    seqt.cursor(&cur.blk, Bound::Included(from.to_be_bytes().to_vec()))?;
                while let Some((key, value)) = seqt.next(&cur.blk, &mut cursor)? {
                    let seqno = util::from_be_bytes(&key)?;
                    if seqno > to {
                        break;
                    }
                    items.insert(seqno, util::from_be_bytes(&value)?);
                }
            }
            let part = self.wal.read().snapshot_committed(st.id);
            for (_, item) in part.iter_seq(from, to) {
                items.insert(item.seqno, item.off);
            }

            let barrier = barriers.get(&st.id).copied().unwrap_or(0);
            let mut trie = Trie::from_root(st.trie_root, cs);
            let mut seqt: Btree<SeqnoKv> = Btree::from_root(nblk, st.seq_root, 8, 8)?;

            for (seqno, off) in items.into_iter() {
                let doc = cur.log.read_doc(off)?;
                if doc.deleted && seqno < barrier {
                    // purge the tombstone, and retire any earlier copy
                    // that made it into the new file.
                    if let Some(old_off) = trie.remove(nblk, nlog, &doc.key)? {
                        let odoc = nlog.read_doc_meta(old_off)?;
                        seqt.remove(nblk, &odoc.seqno.to_be_bytes())?;
                        if !odoc.deleted {
                            st.doc_count = st.doc_count.saturating_sub(1);
                        }
                        let osize = u64::try_from(nlog.rec_size(old_off)?).unwrap();
                        st.active_bytes = st.active_bytes.saturating_sub(osize);
                    }
                } else {
                    let noff = nlog.append_doc(&doc)?;
                    let item = WalItem {
                        off: noff,
                        seqno,
                        deleted: doc.deleted,
                        size: nlog.rec_size(noff)?,
                    };
                    apply_indexed(nblk, nlog, &mut trie, &mut seqt, st, &doc.key, &item)?;
                }
                total += 1;
            }

            st.trie_root = trie.to_root();
            st.seq_root = seqt.to_root();
            applied.insert(st.id, to);
        }
        Ok(total)
    }

    // per store, the seqno below which tombstones may be dropped.
    // purging_interval zero drops every tombstone; otherwise tombstones
    // recorded by headers older than the interval are droppable.
    fn purge_barriers(&self, start: &Arc<FileState>) -> Result<HashMap<u64, u64>> {
        let mut out = HashMap::new();

        if self.config.purging_interval == 0 {
            for st in start.catalog.stores.iter() {
                out.insert(st.id, u64::MAX);
            }
            return Ok(out);
        }

        let cutoff = unix_now().saturating_sub(self.config.purging_interval);
        let mut header = start.header.clone();
        loop {
            if header.timestamp <= cutoff {
                let catalog = read_catalog(&start.log, header.catalog_off)?;
                for st in catalog.stores.iter() {
                    out.insert(st.id, st.last_seqno + 1);
                }
                break;
            }
            if header.prev_bid == NIL_BID {
                break;
            }
            header = CommitHeader::decode_block(&start.blk.read(header.prev_bid)?)?;
        }
        Ok(out)
    }
}

// sibling scratch location the new file is built at before the rename.
fn tmp_location(new_path: &ffi::OsStr) -> ffi::OsString {
    let mut tmp = new_path.to_os_string();
    tmp.push(".compact");
    tmp
}

/// Post a wake-up to the auto-compaction daemon when the stale fraction
/// crossed the configured threshold.
pub(crate) fn nudge(inner: &Inner) {
    if inner.config.compaction_mode != CompactionMode::Auto {
        return;
    }
    if inner.stale_percent() < u64::from(inner.config.compaction_threshold) {
        return;
    }
    if let Ok(guard) = inner.daemon.try_lock() {
        if let Some(th) = guard.as_ref() {
            th.post(Tick::Check).ok();
        }
    }
}

/// Spawn the auto-compaction daemon; it holds only a weak reference and
/// exits with the file.
pub(crate) fn start_daemon(inner: &Arc<Inner>) -> Thread<Tick, Result<()>> {
    let weak = Arc::downgrade(inner);
    let sleep = time::Duration::from_secs(u64::max(1, inner.config.compactor_sleep_duration));

    Thread::new("compactor", move |rx: mpsc::Receiver<Tick>| {
        move || daemon_loop(weak, rx, sleep)
    })
}

fn daemon_loop(
    weak: Weak<Inner>,
    rx: mpsc::Receiver<Tick>,
    sleep: time::Duration,
) -> Result<()> {
    loop {
        match rx.recv_timeout(sleep) {
            Ok(Tick::Check) | Err(mpsc::RecvTimeoutError::Timeout) => (),
            Err(mpsc::RecvTimeoutError::Disconnected) => break Ok(()),
        }

        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => break Ok(()),
        };

        let state = inner.current_state();
        let due = inner.config.compaction_threshold > 0
            && state.blk.num_blocks() >= AUTO_MIN_BLOCKS
            && inner.stale_percent() >= u64::from(inner.config.compaction_threshold);
        if !due {
            continue;
        }

        let path = inner.path.clone();
        match inner.compact(&path) {
            Ok(()) => (),
            // losing the race to a manual compaction or a transaction is
            // not an error for the daemon.
            Err(Error::FailByCompaction(_, _)) | Err(Error::FailByTransaction(_, _)) => (),
            Err(err) => warn!(target: "banyan", "auto compaction: {}", err),
        }
    }
}

#[cfg(test)]
#[path = "compact_test.rs"]
mod compact_test;
