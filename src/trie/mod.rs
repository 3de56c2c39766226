//! Module implement a hierarchical trie of B+trees over variable length
//! keys.
//!
//! Keys of arbitrary length (up to 64KiB) are indexed by slicing them
//! into fixed width chunks. Each layer is a [Btree] keyed by one chunk;
//! a cell either terminates the key with a document offset, points to a
//! child layer keyed by the next chunk, or points to a suffix record in
//! the document-log that inlines the whole remaining key. Chains of
//! single-entry layers therefore never materialize; divergence splits a
//! suffix record into a fresh layer and deletion collapses a layer back
//! into a suffix record.
//!
//! Within a layer the search key is `chunksize + 1` bytes: the zero
//! padded chunk followed by a discriminator byte, `min(remaining-len,
//! chunksize)` for keys that end in this chunk and `chunksize + 1` for
//! keys that continue. The composite preserves byte-lexicographic order
//! of the original keys.
//!
//! A layer skipping a shared run of chunks records the run as its root
//! node's metadata; lookups must match the run before consuming their
//! next chunk.

use cbordata::Cborize;

use std::{convert::TryFrom, ops::Bound, sync::Arc};

use crate::{
    bcache::{BlockFile, NIL_BID},
    btree::{Btree, BytesKv, Cursor},
    dlog::{DocLog, REC_SUFFIX},
    util, Error, Result,
};

/// Default width of a key chunk, in bytes.
pub const CHUNKSIZE: usize = 8;

/// Longest skipped run a single layer may record; longer shared runs
/// chain through further layers.
pub const MAX_RUN: usize = 2048;

const SUFFIX_VER: u32 = 0x00510001;

// value words are 8 bytes with the target kind in the top two bits.
const TAG_DOC: u64 = 0x0;
const TAG_TREE: u64 = 0x1;
const TAG_SUFFIX: u64 = 0x2;
const TAG_SHIFT: u32 = 62;
const OFF_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Compressed tail of a key whose sub-tree would otherwise hold a single
/// entry, stored in the document-log.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct SuffixRec {
    pub suffix: Vec<u8>,
    pub doc_off: u64,
}

impl SuffixRec {
    const ID: u32 = SUFFIX_VER;
}

fn enc_val(tag: u64, off: u64) -> [u8; 8] {
    ((tag << TAG_SHIFT) | off).to_be_bytes()
}

fn dec_val(value: &[u8]) -> Result<(u64, u64)> {
    let word = util::from_be_bytes(value)?;
    Ok((word >> TAG_SHIFT, word & OFF_MASK))
}

fn append_suffix(log: &DocLog, suffix: &[u8], doc_off: u64) -> Result<u64> {
    let rec = SuffixRec { suffix: suffix.to_vec(), doc_off };
    log.append(REC_SUFFIX, &util::into_cbor_bytes(rec)?)
}

fn read_suffix(log: &DocLog, off: u64) -> Result<SuffixRec> {
    match log.read(off)? {
        (REC_SUFFIX, payload) => Ok(util::from_cbor_bytes::<SuffixRec>(&payload)?.0),
        (kind, _) => {
            err_at!(FileCorruption, msg: "expected suffix at {}, kind {}", off, kind)
        }
    }
}

// number of leading bytes shared by `a` and `b`.
fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

// per-layer search key for the remaining bytes: zero padded chunk plus
// discriminator.
fn enc_chunk(rem: &[u8], cs: usize) -> Vec<u8> {
    let mut out = vec![0; cs + 1];
    if rem.len() <= cs {
        out[..rem.len()].copy_from_slice(rem);
        out[cs] = u8::try_from(rem.len()).unwrap();
    } else {
        out[..cs].copy_from_slice(&rem[..cs]);
        out[cs] = u8::try_from(cs + 1).unwrap();
    }
    out
}

// largest fixed width key strictly below `key`, None at zero.
fn predecessor(key: &[u8]) -> Option<Vec<u8>> {
    let mut out = key.to_vec();
    for i in (0..out.len()).rev() {
        if out[i] > 0 {
            out[i] -= 1;
            for b in out[i + 1..].iter_mut() {
                *b = 0xff;
            }
            return Some(out);
        }
    }
    None
}

/// Ordered map from variable length byte-keys to document offsets.
pub struct Trie {
    chunksize: usize,
    root: u64,
}

impl Trie {
    /// Create an empty trie.
    pub fn new(chunksize: usize) -> Trie {
        Trie { chunksize, root: NIL_BID }
    }

    /// Load a trie rooted at `root`.
    pub fn from_root(root: u64, chunksize: usize) -> Trie {
        Trie { chunksize, root }
    }

    #[inline]
    pub fn to_root(&self) -> u64 {
        self.root
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == NIL_BID
    }

    #[inline]
    fn ksize(&self) -> usize {
        self.chunksize + 1
    }

    // search key for the remaining bytes of a key at some layer.
    #[inline]
    fn enc_key(&self, rem: &[u8]) -> Vec<u8> {
        enc_chunk(rem, self.chunksize)
    }

    fn load_tree(&self, blk: &BlockFile, bid: u64) -> Result<Btree<BytesKv>> {
        Btree::from_root(blk, bid, self.ksize(), 8)
    }

    /// Get the document offset indexed under `key`.
    pub fn get(&self, blk: &BlockFile, log: &DocLog, key: &[u8]) -> Result<Option<u64>> {
        if self.root == NIL_BID {
            return Ok(None);
        }

        let cs = self.chunksize;
        let (mut bid, mut pos) = (self.root, 0);
        loop {
            let tree = self.load_tree(blk, bid)?;
            let meta = tree.as_meta();
            if !meta.is_empty() {
                if !key[pos..].starts_with(meta) {
                    return Ok(None);
                }
                pos += meta.len();
            }

            let rem = &key[pos..];
            let enc = self.enc_key(rem);
            let value = match tree.find(blk, &enc)? {
                Some(value) => value,
                None => return Ok(None),
            };
            let (tag, off) = dec_val(&value)?;

            if rem.len() <= cs {
                return Ok(Some(off));
            }
            match tag {
                TAG_TREE => {
                    bid = off;
                    pos += cs;
                }
                TAG_SUFFIX => {
                    let rec = read_suffix(log, off)?;
                    return match rec.suffix == rem[cs..] {
                        true => Ok(Some(rec.doc_off)),
                        false => Ok(None),
                    };
                }
                _ => err_at!(FileCorruption, msg: "doc cell on a continuing chunk")?,
            }
        }
    }

    /// Index `key -> doc_off`. Return the older offset if the key was
    /// already present.
    pub fn insert(
        &mut self,
        blk: &BlockFile,
        log: &DocLog,
        key: &[u8],
        doc_off: u64,
    ) -> Result<Option<u64>> {
        if self.root == NIL_BID {
            let mut tree = Btree::new(self.ksize(), 8);
            self.put_cell(&mut tree, blk, log, key, doc_off)?;
            self.root = tree.to_root();
            return Ok(None);
        }

        let (root, old) = self.ins_rec(blk, log, self.root, key, 0, doc_off)?;
        self.root = root;
        Ok(old)
    }

    fn ins_rec(
        &self,
        blk: &BlockFile,
        log: &DocLog,
        bid: u64,
        key: &[u8],
        mut pos: usize,
        doc_off: u64,
    ) -> Result<(u64, Option<u64>)> {
        let cs = self.chunksize;
        let mut tree = self.load_tree(blk, bid)?;

        let meta = tree.as_meta().to_vec();
        if !meta.is_empty() {
            if !key[pos..].starts_with(&meta) {
                return self.split_meta(blk, log, tree, key, pos, doc_off);
            }
            pos += meta.len();
        }

        let rem = &key[pos..];
        let enc = self.enc_key(rem);

        if rem.len() <= cs {
            let old = match tree.insert(blk, &enc, &enc_val(TAG_DOC, doc_off))? {
                Some(value) => Some(dec_val(&value)?.1),
                None => None,
            };
            return Ok((tree.to_root(), old));
        }

        match tree.find(blk, &enc)? {
            None => {
                let soff = append_suffix(log, &rem[cs..], doc_off)?;
                tree.insert(blk, &enc, &enc_val(TAG_SUFFIX, soff))?;
                Ok((tree.to_root(), None))
            }
            Some(value) => match dec_val(&value)? {
                (TAG_TREE, child) => {
                    let (nchild, old) =
                        self.ins_rec(blk, log, child, key, pos + cs, doc_off)?;
                    if nchild != child {
                        tree.insert(blk, &enc, &enc_val(TAG_TREE, nchild))?;
                    }
                    Ok((tree.to_root(), old))
                }
                (TAG_SUFFIX, soff) => {
                    let rec = read_suffix(log, soff)?;
                    if rec.suffix == rem[cs..] {
                        let noff = append_suffix(log, &rec.suffix, doc_off)?;
                        tree.insert(blk, &enc, &enc_val(TAG_SUFFIX, noff))?;
                        Ok((tree.to_root(), Some(rec.doc_off)))
                    } else {
                        let child = self.branch(
                            blk,
                            log,
                            &rec.suffix,
                            rec.doc_off,
                            &rem[cs..],
                            doc_off,
                        )?;
                        tree.insert(blk, &enc, &enc_val(TAG_TREE, child))?;
                        Ok((tree.to_root(), None))
                    }
                }
                _ => err_at!(FileCorruption, msg: "doc cell on a continuing chunk"),
            },
        }
    }

    // two diverging key tails under the same chunk become a fresh layer,
    // skipping their shared chunk-aligned run. runs beyond [MAX_RUN]
    // chain through nested layers.
    fn branch(
        &self,
        blk: &BlockFile,
        log: &DocLog,
        s1: &[u8],
        off1: u64,
        s2: &[u8],
        off2: u64,
    ) -> Result<u64> {
        let cs = self.chunksize;
        let common = common_prefix(s1, s2);
        let skip = usize::min((common / cs) * cs, (MAX_RUN / cs) * cs);

        let mut tree = Btree::new(self.ksize(), 8);
        if skip > 0 {
            tree.set_meta(blk, s1[..skip].to_vec())?;
        }

        if (common - skip) >= cs {
            // the shared run continues past the capped skip.
            let child =
                self.branch(blk, log, &s1[skip + cs..], off1, &s2[skip + cs..], off2)?;
            let enc = {
                let mut enc = s1[skip..skip + cs].to_vec();
                enc.push(u8::try_from(cs + 1).unwrap());
                enc
            };
            tree.insert(blk, &enc, &enc_val(TAG_TREE, child))?;
        } else {
            self.put_cell(&mut tree, blk, log, &s1[skip..], off1)?;
            self.put_cell(&mut tree, blk, log, &s2[skip..], off2)?;
        }
        Ok(tree.to_root())
    }

    // the layer's skipped run no longer matches the incoming key; carve
    // out a parent layer at the diverging chunk.
    fn split_meta(
        &self,
        blk: &BlockFile,
        log: &DocLog,
        mut old_tree: Btree<BytesKv>,
        key: &[u8],
        pos: usize,
        doc_off: u64,
    ) -> Result<(u64, Option<u64>)> {
        let cs = self.chunksize;
        let run = old_tree.as_meta().to_vec();
        let rem = &key[pos..];
        let skip = (common_prefix(&run, rem) / cs) * cs;

        // the old layer keeps whatever follows its diverging chunk.
        old_tree.set_meta(blk, run[skip + cs..].to_vec())?;

        let mut parent = Btree::new(self.ksize(), 8);
        if skip > 0 {
            parent.set_meta(blk, run[..skip].to_vec())?;
        }
        let old_enc = self.enc_key(&run[skip..]);
        parent.insert(blk, &old_enc, &enc_val(TAG_TREE, old_tree.to_root()))?;
        self.put_cell(&mut parent, blk, log, &rem[skip..], doc_off)?;

        Ok((parent.to_root(), None))
    }

    // place a terminal or suffix cell for the remaining bytes.
    fn put_cell(
        &self,
        tree: &mut Btree<BytesKv>,
        blk: &BlockFile,
        log: &DocLog,
        rem: &[u8],
        doc_off: u64,
    ) -> Result<()> {
        let cs = self.chunksize;
        let enc = self.enc_key(rem);
        if rem.len() <= cs {
            tree.insert(blk, &enc, &enc_val(TAG_DOC, doc_off))?;
        } else {
            let soff = append_suffix(log, &rem[cs..], doc_off)?;
            tree.insert(blk, &enc, &enc_val(TAG_SUFFIX, soff))?;
        }
        Ok(())
    }

    /// Unindex `key`. Return its document offset if it was present.
    pub fn remove(&mut self, blk: &BlockFile, log: &DocLog, key: &[u8]) -> Result<Option<u64>> {
        if self.root == NIL_BID {
            return Ok(None);
        }

        let (act, old) = self.rem_rec(blk, log, self.root, key, 0)?;
        match act {
            RemAct::Kept(root) => self.root = root,
            RemAct::Emptied => self.root = NIL_BID,
        }
        Ok(old)
    }

    fn rem_rec(
        &self,
        blk: &BlockFile,
        log: &DocLog,
        bid: u64,
        key: &[u8],
        mut pos: usize,
    ) -> Result<(RemAct, Option<u64>)> {
        let cs = self.chunksize;
        let mut tree = self.load_tree(blk, bid)?;

        let meta = tree.as_meta().to_vec();
        if !meta.is_empty() {
            if !key[pos..].starts_with(&meta) {
                return Ok((RemAct::Kept(bid), None));
            }
            pos += meta.len();
        }

        let rem = &key[pos..];
        let enc = self.enc_key(rem);

        if rem.len() <= cs {
            let old = match tree.remove(blk, &enc)? {
                Some(value) => Some(dec_val(&value)?.1),
                None => return Ok((RemAct::Kept(bid), None)),
            };
            return Ok((self.fold(tree), old));
        }

        match tree.find(blk, &enc)? {
            None => Ok((RemAct::Kept(bid), None)),
            Some(value) => match dec_val(&value)? {
                (TAG_SUFFIX, soff) => {
                    let rec = read_suffix(log, soff)?;
                    if rec.suffix != rem[cs..] {
                        return Ok((RemAct::Kept(bid), None));
                    }
                    tree.remove(blk, &enc)?;
                    Ok((self.fold(tree), Some(rec.doc_off)))
                }
                (TAG_TREE, child) => {
                    let (act, old) = self.rem_rec(blk, log, child, key, pos + cs)?;
                    if old.is_none() {
                        return Ok((RemAct::Kept(bid), None));
                    }
                    match act {
                        RemAct::Emptied => {
                            tree.remove(blk, &enc)?;
                        }
                        RemAct::Kept(nchild) => match self.collapse(blk, log, nchild)? {
                            Some(soff) => {
                                tree.insert(blk, &enc, &enc_val(TAG_SUFFIX, soff))?;
                            }
                            None if nchild != child => {
                                tree.insert(blk, &enc, &enc_val(TAG_TREE, nchild))?;
                            }
                            None => (),
                        },
                    }
                    Ok((self.fold(tree), old))
                }
                _ => err_at!(FileCorruption, msg: "doc cell on a continuing chunk"),
            },
        }
    }

    fn fold(&self, tree: Btree<BytesKv>) -> RemAct {
        match tree.is_empty() {
            true => RemAct::Emptied,
            false => RemAct::Kept(tree.to_root()),
        }
    }

    // a layer left with exactly one non-tree cell folds back into a
    // suffix record; return the record's offset.
    fn collapse(&self, blk: &BlockFile, log: &DocLog, bid: u64) -> Result<Option<u64>> {
        let cs = self.chunksize;
        let tree = self.load_tree(blk, bid)?;
        let (enc, value) = match tree.single_entry(blk)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let disc = usize::from(enc[cs]);
        let (tag, off) = dec_val(&value)?;

        let mut suffix = tree.as_meta().to_vec();
        let doc_off = match tag {
            TAG_DOC if disc <= cs => {
                suffix.extend_from_slice(&enc[..disc]);
                off
            }
            TAG_SUFFIX => {
                let rec = read_suffix(log, off)?;
                suffix.extend_from_slice(&enc[..cs]);
                suffix.extend_from_slice(&rec.suffix);
                rec.doc_off
            }
            // a lone child layer is left alone.
            _ => return Ok(None),
        };

        Ok(Some(append_suffix(log, &suffix, doc_off)?))
    }
}

enum RemAct {
    Kept(u64),
    Emptied,
}

impl Trie {
    /// Largest indexed key less-than-or-equal to `key`, if any.
    pub fn floor_key(
        &self,
        blk: &BlockFile,
        log: &DocLog,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if self.root == NIL_BID {
            return Ok(None);
        }
        self.floor_rec(blk, log, self.root, key, 0, &[])
    }

    fn floor_rec(
        &self,
        blk: &BlockFile,
        log: &DocLog,
        bid: u64,
        key: &[u8],
        mut pos: usize,
        prefix: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let cs = self.chunksize;
        let tree = self.load_tree(blk, bid)?;

        let mut prefix = prefix.to_vec();
        let meta = tree.as_meta().to_vec();
        if !meta.is_empty() {
            if key[pos..].starts_with(&meta) {
                prefix.extend_from_slice(&meta);
                pos += meta.len();
            } else if meta.as_slice() < &key[pos..] {
                // every key below sorts before the probe.
                prefix.extend_from_slice(&meta);
                return self.max_key(blk, log, &tree, &prefix);
            } else {
                return Ok(None);
            }
        }

        let rem = &key[pos..];
        let enc = self.enc_key(rem);

        let mut bound = enc.clone();
        loop {
            let (e, value) = match tree.find_le(blk, &bound)? {
                Some(entry) => entry,
                None => return Ok(None),
            };
            let disc = usize::from(e[cs]);
            let (tag, off) = dec_val(&value)?;

            if e == enc && rem.len() > cs {
                // same chunk, the probe continues below this cell.
                let down = match tag {
                    TAG_TREE => {
                        let mut p = prefix.clone();
                        p.extend_from_slice(&enc[..cs]);
                        self.floor_rec(blk, log, off, key, pos + cs, &p)?
                    }
                    TAG_SUFFIX => {
                        let rec = read_suffix(log, off)?;
                        match rec.suffix.as_slice() <= &rem[cs..] {
                            true => {
                                let mut k = prefix.clone();
                                k.extend_from_slice(&enc[..cs]);
                                k.extend_from_slice(&rec.suffix);
                                Some(k)
                            }
                            false => None,
                        }
                    }
                    _ => err_at!(FileCorruption, msg: "doc cell on a continuing chunk")?,
                };
                match down {
                    Some(k) => return Ok(Some(k)),
                    None => match predecessor(&e) {
                        Some(p) => {
                            bound = p;
                            continue;
                        }
                        None => return Ok(None),
                    },
                }
            }

            // the cell sorts at-or-before the probe in its entirety.
            return match tag {
                TAG_DOC => {
                    let mut k = prefix;
                    k.extend_from_slice(&e[..disc]);
                    Ok(Some(k))
                }
                TAG_SUFFIX => {
                    let rec = read_suffix(log, off)?;
                    let mut k = prefix;
                    k.extend_from_slice(&e[..cs]);
                    k.extend_from_slice(&rec.suffix);
                    Ok(Some(k))
                }
                TAG_TREE => {
                    let child = self.load_tree(blk, off)?;
                    let mut p = prefix;
                    p.extend_from_slice(&e[..cs]);
                    p.extend_from_slice(child.as_meta());
                    self.max_key(blk, log, &child, &p)
                }
                _ => err_at!(FileCorruption, msg: "bad value tag {}", tag),
            };
        }
    }

    // largest key under `tree`; `prefix` already includes the layer's
    // skipped run.
    fn max_key(
        &self,
        blk: &BlockFile,
        log: &DocLog,
        tree: &Btree<BytesKv>,
        prefix: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let cs = self.chunksize;
        let (e, value) = match tree.max_entry(blk)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let disc = usize::from(e[cs]);
        let (tag, off) = dec_val(&value)?;

        match tag {
            TAG_DOC => {
                let mut k = prefix.to_vec();
                k.extend_from_slice(&e[..disc]);
                Ok(Some(k))
            }
            TAG_SUFFIX => {
                let rec = read_suffix(log, off)?;
                let mut k = prefix.to_vec();
                k.extend_from_slice(&e[..cs]);
                k.extend_from_slice(&rec.suffix);
                Ok(Some(k))
            }
            TAG_TREE => {
                let child = self.load_tree(blk, off)?;
                let mut p = prefix.to_vec();
                p.extend_from_slice(&e[..cs]);
                p.extend_from_slice(child.as_meta());
                self.max_key(blk, log, &child, &p)
            }
            _ => err_at!(FileCorruption, msg: "bad value tag {}", tag),
        }
    }
}

impl Trie {
    /// Iterate keys in ascending byte-lexicographic order, starting at
    /// `start`.
    pub fn iter(
        &self,
        blk: Arc<BlockFile>,
        log: Arc<DocLog>,
        start: Bound<Vec<u8>>,
    ) -> Result<TrieIter> {
        let mut iter = TrieIter {
            chunksize: self.chunksize,
            blk,
            log,
            frames: Vec::default(),
            start: None,
        };

        if self.root == NIL_BID {
            return Ok(iter);
        }

        match start {
            Bound::Unbounded => {
                iter.push_frame(self.root, Vec::default())?;
            }
            Bound::Included(key) => {
                iter.position(self.root, &key)?;
                iter.start = Some((key, true));
            }
            Bound::Excluded(key) => {
                iter.position(self.root, &key)?;
                iter.start = Some((key, false));
            }
        }
        Ok(iter)
    }
}

struct Frame {
    tree: Btree<BytesKv>,
    cursor: Cursor,
    // bytes consumed before this layer's chunks, its skipped run
    // included.
    prefix: Vec<u8>,
}

/// Ascending iterator over a [Trie], yielding `(key, doc-offset)`.
pub struct TrieIter {
    chunksize: usize,
    blk: Arc<BlockFile>,
    log: Arc<DocLog>,
    frames: Vec<Frame>,
    // lower bound and whether it is inclusive.
    start: Option<(Vec<u8>, bool)>,
}

impl TrieIter {
    fn push_frame(&mut self, bid: u64, mut prefix: Vec<u8>) -> Result<()> {
        let tree: Btree<BytesKv> = Btree::from_root(&self.blk, bid, self.chunksize + 1, 8)?;
        prefix.extend_from_slice(tree.as_meta());
        let cursor = tree.cursor(&self.blk, Bound::Unbounded)?;
        self.frames.push(Frame { tree, cursor, prefix });
        Ok(())
    }

    // build the initial frame stack for a lower bound; leading yields
    // below the bound are dropped by the start filter.
    fn position(&mut self, root: u64, key: &[u8]) -> Result<()> {
        let cs = self.chunksize;
        let (mut bid, mut pos) = (root, 0);

        loop {
            let tree: Btree<BytesKv> =
                Btree::from_root(&self.blk, bid, cs + 1, 8)?;
            let meta = tree.as_meta().to_vec();
            let mut prefix = key[..pos].to_vec();

            if !meta.is_empty() {
                if key[pos..].starts_with(&meta) {
                    pos += meta.len();
                } else if meta.as_slice() > &key[pos..] {
                    // the whole layer sorts after the bound.
                    self.push_frame(bid, prefix)?;
                    return Ok(());
                } else {
                    // the whole layer sorts before the bound.
                    return Ok(());
                }
            }
            prefix.extend_from_slice(&meta);

            let rem = &key[pos..];
            let enc = enc_chunk(rem, cs);

            let mut cursor = tree.cursor(&self.blk, Bound::Included(enc.clone()))?;
            let peeked = {
                let mut probe = cursor.clone();
                tree.next(&self.blk, &mut probe)?
            };

            let descend = match &peeked {
                Some((e, value)) if *e == enc && rem.len() > cs => match dec_val(value)? {
                    (TAG_TREE, child) => Some(child),
                    // a suffix cell stays in the cursor; the start
                    // filter decides whether it qualifies.
                    _ => None,
                },
                _ => None,
            };

            match descend {
                Some(child) => {
                    // consume the cell we are descending into.
                    tree.next(&self.blk, &mut cursor)?;
                    self.frames.push(Frame { tree, cursor, prefix });
                    pos += cs;
                    bid = child;
                }
                None => {
                    self.frames.push(Frame { tree, cursor, prefix });
                    return Ok(());
                }
            }
        }
    }

    /// Next `(key, doc-offset)` pair in ascending key order.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let cs = self.chunksize;

        loop {
            let frame = match self.frames.last_mut() {
                Some(frame) => frame,
                None => return Ok(None),
            };

            let (enc, value) = match frame.tree.next(&self.blk, &mut frame.cursor)? {
                Some(entry) => entry,
                None => {
                    self.frames.pop();
                    continue;
                }
            };

            let disc = usize::from(enc[cs]);
            let (tag, off) = dec_val(&value)?;

            let found = if disc <= cs {
                let mut key = frame.prefix.clone();
                key.extend_from_slice(&enc[..disc]);
                Some((key, off))
            } else {
                match tag {
                    TAG_SUFFIX => {
                        let rec = read_suffix(&self.log, off)?;
                        let mut key = frame.prefix.clone();
                        key.extend_from_slice(&enc[..cs]);
                        key.extend_from_slice(&rec.suffix);
                        Some((key, rec.doc_off))
                    }
                    TAG_TREE => {
                        let mut prefix = frame.prefix.clone();
                        prefix.extend_from_slice(&enc[..cs]);
                        self.push_frame(off, prefix)?;
                        None
                    }
                    _ => err_at!(FileCorruption, msg: "bad value tag {}", tag)?,
                }
            };

            if let Some((key, off)) = found {
                match &self.start {
                    Some((from, true)) if key.as_slice() < from.as_slice() => continue,
                    Some((from, false)) if key.as_slice() <= from.as_slice() => continue,
                    _ => return Ok(Some((key, off))),
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
