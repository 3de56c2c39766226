//! Module implement the document-log.
//!
//! Variable length records are packed into document-blocks as
//! `[len-u32][crc-u32][kind-u8][payload]` frames. A record may span any
//! number of blocks; every spanned block carries the document marker as
//! its first byte and the frame resumes right after it. The byte offset
//! at which a frame starts is the record's stable identity, stored in
//! the trees and in the write-ahead-buffer.
//!
//! The log never overwrites, it only grows. Once the containing block
//! falls below the flush-floor the log abandons its tail and continues
//! on a fresh block.

use cbordata::Cborize;

use std::{
    convert::TryFrom,
    sync::{Arc, Mutex},
};

use crate::{
    bcache::{BlockFile, MARKER_DOC, NIL_BID},
    util, Error, Result,
};

mod doc;

pub use doc::{Doc, MAX_KEYLEN};

/// Record kind for documents.
pub const REC_DOC: u8 = 1;
/// Record kind for trie suffix records.
pub const REC_SUFFIX: u8 = 2;
/// Record kind for the store-catalog.
pub const REC_CATALOG: u8 = 3;
/// Record kind for transaction commit-marks.
pub const REC_TXN_MARK: u8 = 4;

const TXN_MARK_VER: u32 = 0x007a0001;

/// Commit-mark of a transaction; its presence in the log makes the
/// transaction's documents eligible for recovery.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct TxnMark {
    pub id: u64,
}

impl TxnMark {
    const ID: u32 = TXN_MARK_VER;
}

// frame header is [len-u32][crc-u32], in big-endian.
const FRAME_HDR: usize = 8;
// sanity cap for a single record.
const LEN_CAP: u32 = 1 << 30;

/// Append-only log of documents and engine records over a [BlockFile].
pub struct DocLog {
    blk: Arc<BlockFile>,
    tail: Mutex<Tail>,
}

// append cursor, off is the in-block offset and stays within
// [1, blocksize].
struct Tail {
    bid: u64,
    off: usize,
}

impl DocLog {
    /// Start a document log over `blk`. The append cursor starts on a
    /// fresh block, reads can address any pre-existing record.
    pub fn new(blk: Arc<BlockFile>) -> DocLog {
        DocLog {
            blk,
            tail: Mutex::new(Tail { bid: NIL_BID, off: 0 }),
        }
    }

    pub fn as_blockfile(&self) -> &Arc<BlockFile> {
        &self.blk
    }

    /// Append a `kind` record and return the offset at which its frame
    /// starts.
    pub fn append(&self, kind: u8, payload: &[u8]) -> Result<u64> {
        let bs = self.blk.to_blocksize();
        let mut tail = self.tail.lock().unwrap();

        let len = err_at!(FailConvert, u32::try_from(payload.len() + 1))?;
        if len > LEN_CAP {
            err_at!(InvalidInput, msg: "record too large {}", len)?
        }

        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&[kind]);
            hasher.update(payload);
            hasher.finalize()
        };

        // frames never span their 8-byte header across blocks.
        let fresh = tail.bid == NIL_BID
            || !self.blk.is_writable(tail.bid)
            || (bs - tail.off) < FRAME_HDR;
        if fresh {
            tail.bid = self.blk.alloc(MARKER_DOC)?;
            tail.off = 1;
        }

        let start = tail.bid * u64::try_from(bs).unwrap() + u64::try_from(tail.off).unwrap();

        let mut frame = Vec::with_capacity(FRAME_HDR + payload.len() + 1);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.push(kind);
        frame.extend_from_slice(payload);

        let mut written = 0;
        while written < frame.len() {
            if tail.off >= bs {
                tail.bid = self.blk.alloc(MARKER_DOC)?;
                tail.off = 1;
            }
            let n = usize::min(bs - tail.off, frame.len() - written);
            let at = tail.off;
            self.blk.with_mut(tail.bid, |data| {
                data[at..at + n].copy_from_slice(&frame[written..written + n]);
                Ok(())
            })?;
            tail.off += n;
            written += n;
        }

        Ok(start)
    }

    /// Read back the record whose frame starts at `off`. Return its kind
    /// and payload.
    pub fn read(&self, off: u64) -> Result<(u8, Vec<u8>)> {
        let hdr = self.read_span(off, FRAME_HDR)?;
        let len = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let crc = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);

        if len == 0 || len > LEN_CAP {
            err_at!(FileCorruption, msg: "record at {} length {}", off, len)?
        }

        let body_off = self.span_end(off, FRAME_HDR);
        let body = self.read_span(body_off, usize::try_from(len).unwrap())?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != crc {
            err_at!(ChecksumError, msg: "record at {}", off)?
        }

        let kind = body[0];
        Ok((kind, body[1..].to_vec()))
    }

    /// On-disk footprint of the record at `off`, including its frame
    /// header.
    pub fn rec_size(&self, off: u64) -> Result<usize> {
        let hdr = self.read_span(off, FRAME_HDR)?;
        let len = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        if len == 0 || len > LEN_CAP {
            err_at!(FileCorruption, msg: "record at {} length {}", off, len)?
        }
        Ok(FRAME_HDR + usize::try_from(len).unwrap())
    }

    /// Logical offset at which the next record shall be placed, barring
    /// interleaved block allocation. Safe starting point for [DocLog::scan].
    pub fn tail_offset(&self) -> u64 {
        let bs = u64::try_from(self.blk.to_blocksize()).unwrap();
        let tail = self.tail.lock().unwrap();
        if tail.bid != NIL_BID && self.blk.is_writable(tail.bid) {
            tail.bid * bs + u64::try_from(tail.off).unwrap()
        } else {
            self.blk.num_blocks() * bs + 1
        }
    }

    /// Iterate over records whose frames start within `[from, to)`,
    /// skipping non-document blocks and unused block tails.
    pub fn scan(&self, from: u64, to: u64) -> LogScan {
        LogScan { log: self, pos: from, to }
    }
}

impl DocLog {
    /// Append a document record.
    pub fn append_doc(&self, doc: &Doc) -> Result<u64> {
        let data = util::into_cbor_bytes(doc.clone())?;
        self.append(REC_DOC, &data)
    }

    /// Read back a document record.
    pub fn read_doc(&self, off: u64) -> Result<Doc> {
        match self.read(off)? {
            (REC_DOC, payload) => Ok(util::from_cbor_bytes::<Doc>(&payload)?.0),
            (kind, _) => err_at!(FileCorruption, msg: "expected doc at {}, kind {}", off, kind),
        }
    }

    /// Read back a document record, dropping its body.
    pub fn read_doc_meta(&self, off: u64) -> Result<Doc> {
        let mut doc = self.read_doc(off)?;
        doc.body = Vec::default();
        Ok(doc)
    }

    // read `n` logical bytes starting at `off`, hopping across block
    // boundaries. every visited block must be a document block.
    fn read_span(&self, off: u64, n: usize) -> Result<Vec<u8>> {
        let bs = self.blk.to_blocksize();
        let bs64 = u64::try_from(bs).unwrap();

        let mut out = Vec::with_capacity(n);
        let mut pos = off;
        while out.len() < n {
            let (bid, mut in_off) = (pos / bs64, usize::try_from(pos % bs64).unwrap());
            if in_off == 0 {
                in_off = 1;
                pos += 1;
            }
            let data = self.blk.read(bid)?;
            if data[0] != MARKER_DOC {
                err_at!(FileCorruption, msg: "record spans non-doc block {}", bid)?
            }
            let take = usize::min(bs - in_off, n - out.len());
            out.extend_from_slice(&data[in_off..in_off + take]);
            pos += u64::try_from(take).unwrap();
        }
        Ok(out)
    }

    // logical position after reading `n` bytes starting at `off`.
    fn span_end(&self, off: u64, n: usize) -> u64 {
        let bs = u64::try_from(self.blk.to_blocksize()).unwrap();
        let mut pos = off;
        let mut n = u64::try_from(n).unwrap();
        while n > 0 {
            if pos % bs == 0 {
                pos += 1;
            }
            let take = u64::min(bs - (pos % bs), n);
            pos += take;
            n -= take;
        }
        pos
    }
}

/// Iterator over the records of a [DocLog], in log order.
pub struct LogScan<'a> {
    log: &'a DocLog,
    pos: u64,
    to: u64,
}

impl<'a> Iterator for LogScan<'a> {
    type Item = Result<(u64, u8, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let bs = u64::try_from(self.log.blk.to_blocksize()).unwrap();

        loop {
            if self.pos >= self.to {
                return None;
            }
            let (bid, in_off) = (self.pos / bs, self.pos % bs);
            if in_off == 0 {
                self.pos += 1;
                continue;
            }

            let data = match self.log.blk.read(bid) {
                Ok(data) => data,
                Err(err) => return Some(Err(err)),
            };
            if data[0] != MARKER_DOC {
                self.pos = (bid + 1) * bs;
                continue;
            }
            if (bs - in_off) < u64::try_from(FRAME_HDR).unwrap() {
                self.pos = (bid + 1) * bs;
                continue;
            }
            let at = usize::try_from(in_off).unwrap();
            if data[at..at + 4] == [0, 0, 0, 0] {
                // unused tail of an abandoned append block.
                self.pos = (bid + 1) * bs;
                continue;
            }

            let start = self.pos;
            return match self.log.read(start) {
                Ok((kind, payload)) => {
                    let size = FRAME_HDR + 1 + payload.len();
                    self.pos = self.log.span_end(start, size);
                    Some(Ok((start, kind, payload)))
                }
                Err(err) => Some(Err(err)),
            };
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
