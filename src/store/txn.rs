use log::warn;

use std::sync::Arc;

use crate::{
    dlog::Doc,
    store::{kvs::KvsHandle, CommitMode, Db, IsolationLevel},
    wal::WalView,
    Error, Result,
};

/// A transaction over one [Db] file.
///
/// Writes routed through a transaction land in a private write-ahead
/// partition, invisible to readers outside it until [Transaction::commit]
/// merges the partition into the committed buffer and commits the file.
/// [Transaction::abort] discards the partition. Multiple transactions
/// may be live on the same file concurrently.
///
/// Reads depend on the isolation level: [IsolationLevel::ReadCommitted]
/// sees the committed state plus the transaction's own writes,
/// [IsolationLevel::ReadUncommitted] additionally sees other live
/// transactions' pending writes.
///
/// A transaction dropped without committing is aborted.
pub struct Transaction {
    db: Db,
    id: u64,
    isolation: IsolationLevel,
    done: bool,
}

impl Transaction {
    pub(crate) fn new(db: Db, id: u64, isolation: IsolationLevel) -> Transaction {
        Transaction { db, id, isolation, done: false }
    }

    #[inline]
    pub fn to_isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn check_handle(&self, kvs: &KvsHandle) -> Result<()> {
        if !Arc::ptr_eq(&self.db.inner, &kvs.as_db().inner) {
            err_at!(InvalidInput, msg: "handle belongs to another file")?
        }
        if kvs.is_snapshot() {
            err_at!(RonlyViolation, msg: "snapshot handles are read-only")?
        }
        Ok(())
    }

    /// Write a document within this transaction; returns its seqno.
    pub fn set(&self, kvs: &KvsHandle, key: &[u8], meta: &[u8], body: &[u8]) -> Result<u64> {
        self.check_handle(kvs)?;
        self.db
            .inner
            .write_doc(kvs.to_store_id(), key, meta, body, false, Some(self.id))
    }

    /// Write a tombstone within this transaction; returns its seqno.
    pub fn del(&self, kvs: &KvsHandle, key: &[u8], meta: &[u8]) -> Result<u64> {
        self.check_handle(kvs)?;
        self.db
            .inner
            .write_doc(kvs.to_store_id(), key, meta, &[], true, Some(self.id))
    }

    /// Fetch the newest document visible to this transaction.
    pub fn get(&self, kvs: &KvsHandle, key: &[u8]) -> Result<Doc> {
        self.check_handle(kvs)?;
        let view = match self.isolation {
            IsolationLevel::ReadCommitted => WalView::Txn(self.id),
            IsolationLevel::ReadUncommitted => WalView::Uncommitted,
        };
        match kvs.get_with_view(view, key, false)? {
            doc if doc.deleted => err_at!(KeyNotFound, msg: "deleted key"),
            doc => Ok(doc),
        }
    }

    /// Merge this transaction into the committed buffer and commit the
    /// file with `mode`. A commit-mark goes into the log first, making
    /// the transaction's documents eligible for recovery.
    pub fn commit(mut self, mode: CommitMode) -> Result<()> {
        self.done = true;
        let inner = &self.db.inner;

        let _w = inner.writer.lock().unwrap();
        let state = inner.current_state();
        let mark = crate::dlog::TxnMark { id: self.id };
        state.log.append(crate::dlog::REC_TXN_MARK, &crate::util::into_cbor_bytes(mark)?)?;
        inner.wal.write().commit_txn(self.id);
        inner.commit_locked(mode)
    }

    /// Discard this transaction's writes.
    pub fn abort(mut self) -> Result<()> {
        self.done = true;
        self.db.inner.wal.write().abort_txn(self.id);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            self.db.inner.wal.write().abort_txn(self.id);
            warn!(target: "banyan", "transaction {} dropped, aborted", self.id);
        }
    }
}

#[cfg(test)]
#[path = "txn_test.rs"]
mod txn_test;
