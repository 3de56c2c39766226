use cbordata::Cborize;
use lazy_static::lazy_static;

use std::convert::TryFrom;

use crate::{
    bcache::{MARKER_HEADER, NIL_BID},
    store::unix_now,
    util, Error, Result,
};

lazy_static! {
    /// Magic byte-string stamped into every commit header.
    pub static ref HEADER_MAGIC: Vec<u8> = {
        let magic = "banyan/commit/v1";
        magic.as_bytes().to_vec()
    };
}

const HEADER_VER: u32 = 0x000c0001;
const CATALOG_VER: u32 = 0x00ca0001;
const STORECAT_VER: u32 = 0x00ca0002;

/// Commit header, the block that roots a file's visible state.
///
/// Headers chain backward through `prev_bid` down to the file's first
/// commit. The store-wise roots live in a catalog record in the
/// document-log; `catalog_off` points at it. `wal_scan_start` is the log
/// offset up to which write-ahead entries have been flushed into the
/// trees, recovery re-reads documents between it and the header to
/// repopulate the buffer.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct CommitHeader {
    pub magic: Vec<u8>,
    pub version: u32,
    pub timestamp: u64,
    pub prev_bid: u64,
    pub wal_scan_start: u64,
    pub catalog_off: u64,
}

impl CommitHeader {
    const ID: u32 = HEADER_VER;

    pub fn new(prev_bid: u64, wal_scan_start: u64, catalog_off: u64) -> CommitHeader {
        CommitHeader {
            magic: HEADER_MAGIC.clone(),
            version: HEADER_VER,
            timestamp: unix_now(),
            prev_bid,
            wal_scan_start,
            catalog_off,
        }
    }

    /// Placeholder head for a virgin file; nothing has been committed
    /// yet and the header chain is empty.
    pub fn initial() -> CommitHeader {
        CommitHeader {
            magic: HEADER_MAGIC.clone(),
            version: HEADER_VER,
            timestamp: 0,
            prev_bid: NIL_BID,
            wal_scan_start: 0,
            catalog_off: NIL_BID,
        }
    }

    /// Serialize into a block image:
    /// `[marker][len-u32][crc-u32][cbor]`, zero padded.
    pub fn encode_block(&self, blocksize: usize) -> Result<Vec<u8>> {
        let payload = util::into_cbor_bytes(self.clone())?;
        let len = err_at!(FailConvert, u32::try_from(payload.len()))?;
        if payload.len() + 9 > blocksize {
            err_at!(Fatal, msg: "commit header overflows block {}", payload.len())?
        }

        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&payload);
            hasher.finalize()
        };

        let mut data = Vec::with_capacity(blocksize);
        data.push(MARKER_HEADER);
        data.extend_from_slice(&len.to_be_bytes());
        data.extend_from_slice(&crc.to_be_bytes());
        data.extend_from_slice(&payload);
        data.resize(blocksize, 0);
        Ok(data)
    }

    /// Decode and validate a candidate header block. Marker, length,
    /// CRC, magic and version must all line up.
    pub fn decode_block(data: &[u8]) -> Result<CommitHeader> {
        check_remaining!(data, 9, "commit header")?;
        if data[0] != MARKER_HEADER {
            err_at!(FileCorruption, msg: "not a header block, marker {:x}", data[0])?
        }

        let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let crc = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let n = usize::try_from(len).unwrap();
        if n == 0 || (n + 9) > data.len() {
            err_at!(FileCorruption, msg: "header length {}", n)?
        }

        let payload = &data[9..9 + n];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != crc {
            err_at!(ChecksumError, msg: "commit header crc")?
        }

        let (header, _) = util::from_cbor_bytes::<CommitHeader>(payload)?;
        if header.magic != *HEADER_MAGIC {
            err_at!(FileCorruption, msg: "commit header magic")?
        }
        if header.version != HEADER_VER {
            err_at!(FileCorruption, msg: "commit header version {:x}", header.version)?
        }
        Ok(header)
    }
}

/// Per-store entry in the [Catalog].
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct StoreCat {
    pub id: u64,
    pub name: String,
    /// Root bid of the store's key-index trie.
    pub trie_root: u64,
    /// Root bid of the store's seqno-index.
    pub seq_root: u64,
    pub last_seqno: u64,
    pub doc_count: u64,
    /// Live bytes attributed to this store, drives compaction.
    pub active_bytes: u64,
}

impl StoreCat {
    const ID: u32 = STORECAT_VER;

    pub fn new(id: u64, name: &str) -> StoreCat {
        StoreCat {
            id,
            name: name.to_string(),
            trie_root: NIL_BID,
            seq_root: NIL_BID,
            last_seqno: 0,
            doc_count: 0,
            active_bytes: 0,
        }
    }
}

/// Catalog of the stores living in one file, serialized as a record in
/// the document-log and rooted from the commit header.
#[derive(Clone, Debug, Default, Eq, PartialEq, Cborize)]
pub struct Catalog {
    pub next_id: u64,
    pub stores: Vec<StoreCat>,
}

impl Catalog {
    const ID: u32 = CATALOG_VER;

    pub fn get(&self, id: u64) -> Option<&StoreCat> {
        self.stores.iter().find(|st| st.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut StoreCat> {
        self.stores.iter_mut().find(|st| st.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&StoreCat> {
        self.stores.iter().find(|st| st.name == name)
    }

    /// Add a fresh store and return its id.
    pub fn add(&mut self, name: &str) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.stores.push(StoreCat::new(id, name));
        id
    }
}

#[cfg(test)]
#[path = "header_test.rs"]
mod header_test;
