//! Module implement a copy-on-write B+tree whose nodes are blocks.
//!
//! The tree maps fixed width keys to fixed width values and is rooted at
//! a bid. Every mutation produces a new root, except when the target
//! node's block is still above the flush-floor, in which case the node
//! is patched in place. Earlier roots stay valid for concurrent readers,
//! which is what the rest of the engine builds its MVCC on.
//!
//! Key/value access, comparison and splitter policy are supplied by a
//! [KvSpec] capability chosen per tree at construction; dispatch is
//! static.

use std::{cmp, marker, ops::Bound};

use crate::{
    bcache::{BlockFile, MARKER_NODE, NIL_BID},
    Error, Result,
};

mod node;

use node::Node;

/// Capability set parameterizing a [Btree] over its key ordering.
pub trait KvSpec {
    /// Total order over `ksize` wide keys.
    fn cmp(a: &[u8], b: &[u8]) -> cmp::Ordering;

    /// Pick the key that separates two sibling nodes, given the right
    /// sibling's smallest key. On equal candidates the right-most key of
    /// the left sibling is the same byte-string, so the default suits
    /// every fixed width ordering.
    fn splitter(right_first: &[u8]) -> Vec<u8> {
        right_first.to_vec()
    }
}

/// Byte-lexicographic ordering, used by the key-index chunk trees.
pub struct BytesKv;

impl KvSpec for BytesKv {
    #[inline]
    fn cmp(a: &[u8], b: &[u8]) -> cmp::Ordering {
        a.cmp(b)
    }
}

/// Numeric ordering over 8-byte big-endian seqnos, used by the seq-index.
pub struct SeqnoKv;

impl KvSpec for SeqnoKv {
    #[inline]
    fn cmp(a: &[u8], b: &[u8]) -> cmp::Ordering {
        let x = u64::from_be_bytes([a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]]);
        let y = u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        x.cmp(&y)
    }
}

// outcome of a recursive insert.
enum Ins {
    Plain { bid: u64, old: Option<Vec<u8>> },
    Split { left: u64, right: u64, skey: Vec<u8>, old: Option<Vec<u8>> },
}

// outcome of a recursive remove.
struct Rem {
    bid: u64,
    old: Option<Vec<u8>>,
    underflow: bool,
    empty: bool,
}

/// Copy-on-write B+tree over fixed width keys and values.
///
/// The root node may carry a small metadata byte-run, preserved across
/// splits, merges and root collapse. The trie layers use it to record
/// their skipped key-prefix.
pub struct Btree<S: KvSpec> {
    ksize: usize,
    vsize: usize,
    root: u64,
    meta: Vec<u8>,

    _spec: marker::PhantomData<S>,
}

impl<S: KvSpec> Btree<S> {
    /// Create an empty tree. Nothing is written until the first insert.
    pub fn new(ksize: usize, vsize: usize) -> Btree<S> {
        Btree {
            ksize,
            vsize,
            root: NIL_BID,
            meta: Vec::default(),
            _spec: marker::PhantomData,
        }
    }

    /// Load a tree rooted at `root`, reading back its metadata.
    pub fn from_root(blk: &BlockFile, root: u64, ksize: usize, vsize: usize) -> Result<Btree<S>> {
        let mut tree = Btree::new(ksize, vsize);
        tree.root = root;
        if root != NIL_BID {
            let node = tree.read_node(blk, root)?;
            if node.ksize != ksize {
                err_at!(FileCorruption, msg: "root {} ksize {}/{}", root, node.ksize, ksize)?
            }
            tree.meta = node.meta;
        }
        Ok(tree)
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
    pub fn as_meta(&self) -> &[u8] {
        &self.meta
    }

    /// Replace the tree's metadata byte-run.
    pub fn set_meta(&mut self, blk: &BlockFile, meta: Vec<u8>) -> Result<()> {
        self.meta = meta;
        if self.root != NIL_BID {
            let mut node = self.read_node(blk, self.root)?;
            node.set_meta(self.meta.clone());
            self.root = self.write_node(blk, self.root, &node)?;
        }
        Ok(())
    }

    /// Get `key`'s value.
    pub fn find(&self, blk: &BlockFile, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root == NIL_BID {
            return Ok(None);
        }
        let mut bid = self.root;
        loop {
            let node = self.read_node(blk, bid)?;
            if node.is_leaf() {
                return match node.search::<S>(key) {
                    Ok(i) => Ok(Some(node.val_at(i).to_vec())),
                    Err(_) => Ok(None),
                };
            }
            bid = node.child_bid(node.child_index::<S>(key));
        }
    }

    /// Largest entry whose key is less-than-or-equal to `key`.
    pub fn find_le(&self, blk: &BlockFile, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.root == NIL_BID {
            return Ok(None);
        }
        self.find_le_rec(blk, self.root, key)
    }

    fn find_le_rec(
        &self,
        blk: &BlockFile,
        bid: u64,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let node = self.read_node(blk, bid)?;
        if node.is_leaf() {
            return match node.search::<S>(key) {
                Ok(i) => Ok(Some((node.key_at(i).to_vec(), node.val_at(i).to_vec()))),
                Err(0) => Ok(None),
                Err(i) => Ok(Some((node.key_at(i - 1).to_vec(), node.val_at(i - 1).to_vec()))),
            };
        }
        let mut i = node.child_index::<S>(key);
        loop {
            match self.find_le_rec(blk, node.child_bid(i), key)? {
                Some(entry) => break Ok(Some(entry)),
                None if i == 0 => break Ok(None),
                None => i -= 1,
            }
        }
    }

    /// Largest entry of the tree.
    pub fn max_entry(&self, blk: &BlockFile) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.root == NIL_BID {
            return Ok(None);
        }
        let mut bid = self.root;
        loop {
            let node = self.read_node(blk, bid)?;
            if node.nentry() == 0 {
                return Ok(None);
            }
            let i = node.nentry() - 1;
            if node.is_leaf() {
                return Ok(Some((node.key_at(i).to_vec(), node.val_at(i).to_vec())));
            }
            bid = node.child_bid(i);
        }
    }

    /// Return the tree's only entry, or None when it holds zero or more
    /// than one.
    pub fn single_entry(&self, blk: &BlockFile) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.root == NIL_BID {
            return Ok(None);
        }
        let node = self.read_node(blk, self.root)?;
        match (node.is_leaf(), node.nentry()) {
            (true, 1) => Ok(Some((node.key_at(0).to_vec(), node.val_at(0).to_vec()))),
            _ => Ok(None),
        }
    }

    /// Upsert `key`. Return the older value if the key was present.
    pub fn insert(&mut self, blk: &BlockFile, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.validate_kv(key, value)?;

        if self.root == NIL_BID {
            let mut node = Node::new_leaf(self.ksize, self.vsize);
            node.set_meta(self.meta.clone());
            node.insert_at(0, key, value);
            self.root = self.write_node(blk, NIL_BID, &node)?;
            return Ok(None);
        }

        match self.insert_rec(blk, self.root, key, value)? {
            Ins::Plain { bid, old } => {
                self.root = bid;
                Ok(old)
            }
            Ins::Split { left, right, skey, old } => {
                let (level, lkey) = {
                    let lnode = self.read_node(blk, left)?;
                    (lnode.level + 1, lnode.key_at(0).to_vec())
                };
                let mut root = Node::new_internal(self.ksize, level);
                root.set_meta(self.meta.clone());
                root.insert_at(0, &lkey, &left.to_be_bytes());
                root.insert_at(1, &skey, &right.to_be_bytes());
                self.root = self.write_node(blk, NIL_BID, &root)?;
                Ok(old)
            }
        }
    }

    fn insert_rec(&self, blk: &BlockFile, bid: u64, key: &[u8], value: &[u8]) -> Result<Ins> {
        let mut node = self.read_node(blk, bid)?;

        if node.is_leaf() {
            let old = match node.search::<S>(key) {
                Ok(i) => {
                    let old = node.val_at(i).to_vec();
                    node.set_val_at(i, value);
                    Some(old)
                }
                Err(i) => {
                    node.insert_at(i, key, value);
                    None
                }
            };
            return self.finish_node(blk, bid, node, old);
        }

        let i = node.child_index::<S>(key);
        let child = node.child_bid(i);
        match self.insert_rec(blk, child, key, value)? {
            Ins::Plain { bid: nchild, old } if nchild == child => Ok(Ins::Plain { bid, old }),
            Ins::Plain { bid: nchild, old } => {
                node.set_val_at(i, &nchild.to_be_bytes());
                self.finish_node(blk, bid, node, old)
            }
            Ins::Split { left, right, skey, old } => {
                node.set_val_at(i, &left.to_be_bytes());
                node.insert_at(i + 1, &skey, &right.to_be_bytes());
                self.finish_node(blk, bid, node, old)
            }
        }
    }

    // write out a mutated node, splitting it at the median if it no
    // longer fits its block.
    fn finish_node(
        &self,
        blk: &BlockFile,
        bid: u64,
        mut node: Node,
        old: Option<Vec<u8>>,
    ) -> Result<Ins> {
        if node.fits(blk.to_blocksize()) {
            let nbid = self.write_node(blk, bid, &node)?;
            return Ok(Ins::Plain { bid: nbid, old });
        }

        let right = node.split_off();
        let skey = S::splitter(right.key_at(0));
        let left = self.write_node(blk, bid, &node)?;
        let right = self.write_node(blk, NIL_BID, &right)?;
        Ok(Ins::Split { left, right, skey, old })
    }

    /// Remove `key`. Return the older value if the key was present.
    pub fn remove(&mut self, blk: &BlockFile, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root == NIL_BID {
            return Ok(None);
        }

        let r = self.remove_rec(blk, self.root, key)?;
        if r.old.is_none() {
            return Ok(None);
        }

        if r.empty {
            self.root = NIL_BID;
            return Ok(r.old);
        }
        self.root = r.bid;

        // root collapse: an internal root left with a single child hands
        // its place (and metadata) to that child.
        loop {
            let node = self.read_node(blk, self.root)?;
            if node.is_leaf() || node.nentry() > 1 {
                break;
            }
            let child = node.child_bid(0);
            if self.meta.is_empty() {
                self.root = child;
                continue;
            }
            let mut cnode = self.read_node(blk, child)?;
            cnode.set_meta(self.meta.clone());
            self.root = self.write_node(blk, child, &cnode)?;
        }

        Ok(r.old)
    }

    fn remove_rec(&self, blk: &BlockFile, bid: u64, key: &[u8]) -> Result<Rem> {
        let mut node = self.read_node(blk, bid)?;

        if node.is_leaf() {
            let old = match node.search::<S>(key) {
                Ok(i) => node.remove_at(i).1,
                Err(_) => {
                    return Ok(Rem { bid, old: None, underflow: false, empty: false })
                }
            };
            if node.nentry() == 0 {
                return Ok(Rem { bid, old: Some(old), underflow: false, empty: true });
            }
            let underflow = node.nentry() < self.min_entries(blk);
            let nbid = self.write_node(blk, bid, &node)?;
            return Ok(Rem { bid: nbid, old: Some(old), underflow, empty: false });
        }

        let i = node.child_index::<S>(key);
        let child = node.child_bid(i);
        let r = self.remove_rec(blk, child, key)?;
        if r.old.is_none() {
            return Ok(Rem { bid, old: None, underflow: false, empty: false });
        }

        if r.empty {
            node.remove_at(i);
        } else {
            if r.bid != child {
                node.set_val_at(i, &r.bid.to_be_bytes());
            }
            if r.underflow {
                self.rebalance(blk, &mut node, i)?;
            }
        }

        if node.nentry() == 0 {
            return Ok(Rem { bid, old: r.old, underflow: false, empty: true });
        }

        let underflow = node.nentry() < self.min_entries(blk);
        let nbid = self.write_node(blk, bid, &node)?;
        Ok(Rem { bid: nbid, old: r.old, underflow, empty: false })
    }

    // child `i` of `parent` fell below half occupancy. borrow a cell from
    // a sibling, or merge the pair when both fit in a single node.
    fn rebalance(&self, blk: &BlockFile, parent: &mut Node, i: usize) -> Result<()> {
        if parent.nentry() < 2 {
            return Ok(());
        }
        let (li, ri) = if i > 0 { (i - 1, i) } else { (i, i + 1) };
        let (lbid, rbid) = (parent.child_bid(li), parent.child_bid(ri));
        let mut left = self.read_node(blk, lbid)?;
        let mut right = self.read_node(blk, rbid)?;

        let merged_footprint =
            left.footprint() + right.nentry() * (left.ksize + left.vsize);
        if merged_footprint <= blk.to_blocksize() {
            left.merge_from(&right);
            let nl = self.write_node(blk, lbid, &left)?;
            parent.set_val_at(li, &nl.to_be_bytes());
            parent.remove_at(ri);
            return Ok(());
        }

        // borrow towards the shorter side.
        if left.nentry() > right.nentry() {
            let (k, v) = left.remove_at(left.nentry() - 1);
            right.insert_at(0, &k, &v);
        } else {
            let (k, v) = right.remove_at(0);
            left.insert_at(left.nentry(), &k, &v);
        }
        let nl = self.write_node(blk, lbid, &left)?;
        let nr = self.write_node(blk, rbid, &right)?;
        parent.set_val_at(li, &nl.to_be_bytes());
        parent.set_val_at(ri, &nr.to_be_bytes());
        parent.set_key_at(ri, right.key_at(0));
        Ok(())
    }
}

impl<S: KvSpec> Btree<S> {
    /// Position a forward cursor at `start`.
    pub fn cursor(&self, blk: &BlockFile, start: Bound<Vec<u8>>) -> Result<Cursor> {
        let mut cur = Cursor { path: Vec::default(), done: self.root == NIL_BID };
        if cur.done {
            return Ok(cur);
        }

        match &start {
            Bound::Unbounded => self.descend_first(blk, self.root, &mut cur.path)?,
            Bound::Included(key) | Bound::Excluded(key) => {
                let mut bid = self.root;
                loop {
                    let node = self.read_node(blk, bid)?;
                    if node.is_leaf() {
                        let i = match node.search::<S>(key) {
                            Ok(i) => i,
                            Err(i) => i,
                        };
                        cur.path.push((bid, i));
                        break;
                    }
                    let i = node.child_index::<S>(key);
                    cur.path.push((bid, i));
                    bid = node.child_bid(i);
                }
            }
        }

        if let Bound::Excluded(key) = start {
            if let Some((k, _)) = self.peek(blk, &cur)? {
                if S::cmp(&k, &key) == cmp::Ordering::Equal {
                    self.next(blk, &mut cur)?;
                }
            }
        }

        Ok(cur)
    }

    /// Step the cursor, returning the entry it was positioned at.
    pub fn next(&self, blk: &BlockFile, cur: &mut Cursor) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if cur.done || cur.path.is_empty() {
                cur.done = true;
                return Ok(None);
            }

            let (bid, i) = *cur.path.last().unwrap();
            let node = self.read_node(blk, bid)?;
            if node.is_leaf() {
                if i < node.nentry() {
                    cur.path.last_mut().unwrap().1 = i + 1;
                    return Ok(Some((node.key_at(i).to_vec(), node.val_at(i).to_vec())));
                }
                cur.path.pop();
                self.advance_parent(blk, cur)?;
                continue;
            }

            // non-leaf on top happens only on an empty path state.
            cur.path.pop();
        }
    }

    // current entry without moving the cursor.
    fn peek(&self, blk: &BlockFile, cur: &Cursor) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut probe = Cursor { path: cur.path.clone(), done: cur.done };
        self.next(blk, &mut probe)
    }

    // leaf exhausted: move to the next leaf, left-most descent from the
    // closest parent with a further child.
    fn advance_parent(&self, blk: &BlockFile, cur: &mut Cursor) -> Result<()> {
        while let Some((bid, i)) = cur.path.pop() {
            let node = self.read_node(blk, bid)?;
            if (i + 1) < node.nentry() {
                cur.path.push((bid, i + 1));
                let child = node.child_bid(i + 1);
                self.descend_first(blk, child, &mut cur.path)?;
                return Ok(());
            }
        }
        cur.done = true;
        Ok(())
    }

    fn descend_first(
        &self,
        blk: &BlockFile,
        mut bid: u64,
        path: &mut Vec<(u64, usize)>,
    ) -> Result<()> {
        loop {
            let node = self.read_node(blk, bid)?;
            path.push((bid, 0));
            if node.is_leaf() {
                return Ok(());
            }
            bid = node.child_bid(0);
        }
    }
}

impl<S: KvSpec> Btree<S> {
    fn validate_kv(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() != self.ksize {
            err_at!(InvalidInput, msg: "key width {}/{}", key.len(), self.ksize)?
        }
        if value.len() != self.vsize {
            err_at!(InvalidInput, msg: "value width {}/{}", value.len(), self.vsize)?
        }
        Ok(())
    }

    // half of a meta-less node's cell capacity.
    fn min_entries(&self, blk: &BlockFile) -> usize {
        ((blk.to_blocksize() - node::NODE_HDR) / (self.ksize + self.vsize)) / 2
    }

    fn read_node(&self, blk: &BlockFile, bid: u64) -> Result<Node> {
        Node::decode(MARKER_NODE, &blk.read(bid)?)
    }

    // in-place when the block is above the flush-floor, copy-on-write
    // into a fresh block otherwise.
    fn write_node(&self, blk: &BlockFile, bid: u64, node: &Node) -> Result<u64> {
        let data = node.encode(MARKER_NODE, blk.to_blocksize())?;
        if bid != NIL_BID && blk.is_writable(bid) {
            blk.write(bid, data)?;
            Ok(bid)
        } else {
            let nbid = blk.alloc(MARKER_NODE)?;
            blk.write(nbid, data)?;
            Ok(nbid)
        }
    }
}

/// Forward cursor over a [Btree], carrying the path from root to the
/// current leaf. The pinned root must stay reachable for the cursor to
/// remain valid.
#[derive(Clone)]
pub struct Cursor {
    // (bid, index) per level; for leaves the index is the next cell to
    // yield, for internal nodes the child we descended into.
    path: Vec<(u64, usize)>,
    done: bool,
}
