use cbordata::Cborize;

use std::{
    cmp,
    fmt::{self, Display},
    result,
};

/// Maximum supported key length, in bytes.
pub const MAX_KEYLEN: usize = 64 * 1024;

const DOC_VER: u32 = 0x000d0001;

/// Document, the unit of storage.
///
/// A document belongs to exactly one store within the file and carries
/// an application key, optional application metadata and a body. The
/// `seqno` is assigned at write time and is unique within the store;
/// tombstones keep their key and metadata while `deleted` is flipped on
/// and the body is empty.
#[derive(Clone, Debug, Default, Eq, Cborize)]
pub struct Doc {
    pub store: u64,
    pub key: Vec<u8>,
    pub meta: Vec<u8>,
    pub body: Vec<u8>,
    pub seqno: u64,
    pub deleted: bool,
    /// Id of the transaction this document was written under, zero for
    /// plain writes. Recovery only honors transactional documents whose
    /// commit-mark made it into the log.
    pub txn: u64,
}

impl PartialEq for Doc {
    fn eq(&self, other: &Self) -> bool {
        self.store == other.store
            && self.key == other.key
            && self.meta == other.meta
            && self.body == other.body
            && self.seqno == other.seqno
            && self.deleted == other.deleted
            && self.txn == other.txn
    }
}

impl PartialOrd for Doc {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Doc {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.seqno.cmp(&other.seqno)
    }
}

impl Display for Doc {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "doc<store:{} klen:{} seqno:{} deleted:{}>",
            self.store,
            self.key.len(),
            self.seqno,
            self.deleted
        )
    }
}

impl Doc {
    const ID: u32 = DOC_VER;

    /// New live document.
    pub fn new_set(store: u64, key: Vec<u8>, meta: Vec<u8>, body: Vec<u8>, seqno: u64) -> Doc {
        Doc { store, key, meta, body, seqno, deleted: false, txn: 0 }
    }

    /// New tombstone for `key`.
    pub fn new_del(store: u64, key: Vec<u8>, meta: Vec<u8>, seqno: u64) -> Doc {
        Doc { store, key, meta, body: Vec::default(), seqno, deleted: true, txn: 0 }
    }

    #[inline]
    pub fn to_seqno(&self) -> u64 {
        self.seqno
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Approximate in-file footprint of this document.
    pub fn footprint(&self) -> usize {
        32 + self.key.len() + self.meta.len() + self.body.len()
    }
}

#[cfg(test)]
#[path = "doc_test.rs"]
mod doc_test;
