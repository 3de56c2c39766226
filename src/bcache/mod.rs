//! Module implement the block-device abstraction and its buffer-cache.
//!
//! A database file is managed as an append-only stream of fixed size
//! blocks, identified by their `bid`, the offset-in-blocks within the
//! file. Blocks are allocated at the append frontier, cached in memory
//! with dirty tracking, and evicted under clock order. Dirty blocks are
//! written back before eviction, so a bounded cache never loses data.
//!
//! Mutability discipline: a block can be mutated in place only while
//! `bid >= flush_floor`. The floor advances to the frontier every time a
//! new root set is published (WAL flush completion, commit, rollback,
//! compaction swap). Everything below the floor is immutable and may
//! only be superseded by copy-on-write into a fresh block.

use fs2::FileExt;
use log::debug;

use std::{
    collections::HashMap,
    convert::TryFrom,
    ffi, fs,
    os::unix::fs::FileExt as UnixFileExt,
    sync::{Arc, Mutex},
};

use crate::{Error, Result};

/// Marker byte for blocks holding document records.
pub const MARKER_DOC: u8 = 0xD7;
/// Marker byte for blocks holding btree nodes.
pub const MARKER_NODE: u8 = 0xB7;
/// Marker byte for commit-header blocks.
pub const MARKER_HEADER: u8 = 0xC7;

/// Nil sentinel for block-ids, akin to null pointer.
pub const NIL_BID: u64 = u64::MAX;

/// Minimum number of cached blocks, regardless of configured cache size.
pub const MIN_CACHE_BLOCKS: usize = 64;

/// Append-only block file with a bounded buffer-cache.
///
/// All methods take `&self`; an internal mutex serializes cache
/// book-keeping while the file descriptor supports positional reads and
/// writes from concurrent threads.
pub struct BlockFile {
    location: ffi::OsString,
    fd: fs::File,
    blocksize: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    // next bid to be allocated, doubles up as block-count of the file.
    frontier: u64,
    // bids >= flush_floor are yet to be published and can be mutated
    // in place.
    flush_floor: u64,
    max_slots: usize,
    slots: HashMap<u64, Slot>,
    // ring of cached bids, in clock order.
    clock: Vec<u64>,
    hand: usize,
}

struct Slot {
    data: Arc<Vec<u8>>,
    dirty: bool,
    pinned: u32,
    referenced: bool,
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        self.fd.unlock().ok();
    }
}

impl BlockFile {
    /// Open a block file at `location`. If `create` is true, missing files
    /// (and parent directories) are created. The file is advisory-locked
    /// for the lifetime of this value.
    pub fn open(
        location: &ffi::OsStr,
        blocksize: usize,
        cache_limit: usize,
        create: bool,
    ) -> Result<BlockFile> {
        let fd = crate::util::open_file_rw(location, create)?;
        err_at!(OpenFail, fd.try_lock_exclusive(), "lock {:?}", location)?;

        let n = err_at!(IOError, fd.metadata())?.len();
        let frontier = n / u64::try_from(blocksize).unwrap();

        let max_slots = usize::max(cache_limit / blocksize, MIN_CACHE_BLOCKS);

        let inner = Inner {
            frontier,
            flush_floor: frontier,
            max_slots,
            slots: HashMap::new(),
            clock: Vec::new(),
            hand: 0,
        };

        debug!(
            target: "bcache",
            "open {:?} blocks:{} cache-slots:{}", location, frontier, max_slots
        );

        Ok(BlockFile {
            location: location.to_os_string(),
            fd,
            blocksize,
            inner: Mutex::new(inner),
        })
    }

    pub fn to_location(&self) -> ffi::OsString {
        self.location.clone()
    }

    #[inline]
    pub fn to_blocksize(&self) -> usize {
        self.blocksize
    }

    /// Number of blocks allocated so far, including cached-only blocks.
    pub fn num_blocks(&self) -> u64 {
        self.inner.lock().unwrap().frontier
    }

    /// Logical size of the file in bytes.
    pub fn to_file_size(&self) -> u64 {
        self.num_blocks() * u64::try_from(self.blocksize).unwrap()
    }

    /// Return whether `bid` may be mutated in place.
    pub fn is_writable(&self, bid: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        bid >= inner.flush_floor && bid < inner.frontier
    }

    /// Freeze every block allocated so far. To be called when a new root
    /// set is published.
    pub fn publish(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.flush_floor = inner.frontier;
    }

    /// Allocate a fresh block at the append frontier, stamped with
    /// `marker` as its first byte. The block starts out dirty.
    pub fn alloc(&self, marker: u8) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();

        let bid = inner.frontier;
        inner.frontier += 1;

        let mut data = vec![0; self.blocksize];
        data[0] = marker;

        let slot = Slot {
            data: Arc::new(data),
            dirty: true,
            pinned: 0,
            referenced: true,
        };
        self.install(&mut inner, bid, slot)?;

        Ok(bid)
    }

    /// Read block `bid`, from cache or from disk.
    pub fn read(&self, bid: u64) -> Result<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();

        if bid >= inner.frontier {
            err_at!(ReadFail, msg: "block {} beyond frontier {}", bid, inner.frontier)?
        }

        if let Some(slot) = inner.slots.get_mut(&bid) {
            slot.referenced = true;
            return Ok(Arc::clone(&slot.data));
        }

        let data = Arc::new(self.read_disk(bid)?);
        let slot = Slot {
            data: Arc::clone(&data),
            dirty: false,
            pinned: 0,
            referenced: true,
        };
        self.install(&mut inner, bid, slot)?;

        Ok(data)
    }

    /// Replace the content of a writable block.
    pub fn write(&self, bid: u64, data: Vec<u8>) -> Result<()> {
        if data.len() != self.blocksize {
            err_at!(Fatal, msg: "bad block image {}/{}", data.len(), self.blocksize)?
        }

        let mut inner = self.inner.lock().unwrap();
        if bid < inner.flush_floor || bid >= inner.frontier {
            err_at!(Fatal, msg: "block {} is not writable", bid)?
        }

        match inner.slots.get_mut(&bid) {
            Some(slot) => {
                slot.data = Arc::new(data);
                slot.dirty = true;
                slot.referenced = true;
            }
            None => {
                let slot = Slot {
                    data: Arc::new(data),
                    dirty: true,
                    pinned: 0,
                    referenced: true,
                };
                self.install(&mut inner, bid, slot)?;
            }
        }

        Ok(())
    }

    /// Mutate a writable block in place.
    pub fn with_mut<F, T>(&self, bid: u64, f: F) -> Result<T>
    where
        F: FnOnce(&mut [u8]) -> Result<T>,
    {
        let mut inner = self.inner.lock().unwrap();
        if bid < inner.flush_floor || bid >= inner.frontier {
            err_at!(Fatal, msg: "block {} is not writable", bid)?
        }

        if !inner.slots.contains_key(&bid) {
            let slot = Slot {
                data: Arc::new(self.read_disk(bid)?),
                dirty: false,
                pinned: 0,
                referenced: true,
            };
            self.install(&mut inner, bid, slot)?;
        }

        let slot = inner.slots.get_mut(&bid).unwrap();
        let res = f(Arc::make_mut(&mut slot.data).as_mut_slice())?;
        slot.dirty = true;
        slot.referenced = true;

        Ok(res)
    }

    /// Pin `bid` into the cache, disabling its eviction.
    pub fn pin(&self, bid: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.get_mut(&bid) {
            slot.pinned += 1;
        }
    }

    /// Release an earlier pin on `bid`.
    pub fn unpin(&self, bid: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.get_mut(&bid) {
            slot.pinned = slot.pinned.saturating_sub(1);
        }
    }

    /// Write out every dirty block, in bid order.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let mut bids: Vec<u64> = inner
            .slots
            .iter()
            .filter_map(|(bid, slot)| if slot.dirty { Some(*bid) } else { None })
            .collect();
        bids.sort_unstable();

        for bid in bids.into_iter() {
            let slot = inner.slots.get_mut(&bid).unwrap();
            let data = Arc::clone(&slot.data);
            slot.dirty = false;
            self.write_disk(bid, &data)?;
        }

        Ok(())
    }

    /// Flush the os-cache for this file onto disk.
    pub fn sync(&self) -> Result<()> {
        err_at!(IOError, self.fd.sync_data(), "sync {:?}", self.location)
    }

    /// Truncate the file to `n` blocks, dropping cached blocks beyond.
    pub fn truncate_blocks(&self, n: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let size = n * u64::try_from(self.blocksize).unwrap();
        err_at!(IOError, self.fd.set_len(size), "truncate {:?}", self.location)?;

        inner.frontier = n;
        inner.flush_floor = n;
        inner.slots.retain(|bid, _| *bid < n);
        inner.clock.retain(|bid| *bid < n);
        inner.hand = 0;

        Ok(())
    }
}

impl BlockFile {
    fn read_disk(&self, bid: u64) -> Result<Vec<u8>> {
        let fpos = bid * u64::try_from(self.blocksize).unwrap();
        let mut buf = vec![0; self.blocksize];
        err_at!(
            ReadFail,
            self.fd.read_exact_at(&mut buf, fpos),
            "block {} in {:?}",
            bid,
            self.location
        )?;
        Ok(buf)
    }

    fn write_disk(&self, bid: u64, data: &[u8]) -> Result<()> {
        let fpos = bid * u64::try_from(self.blocksize).unwrap();
        err_at!(
            WriteFail,
            self.fd.write_all_at(data, fpos),
            "block {} in {:?}",
            bid,
            self.location
        )
    }

    // install a slot into the cache, evicting a victim if full.
    fn install(&self, inner: &mut Inner, bid: u64, slot: Slot) -> Result<()> {
        if inner.slots.len() >= inner.max_slots {
            self.evict(inner)?;
        }
        inner.slots.insert(bid, slot);
        inner.clock.push(bid);
        Ok(())
    }

    // clock eviction. referenced slots get a second chance, pinned slots
    // are skipped, dirty victims are written back first.
    fn evict(&self, inner: &mut Inner) -> Result<()> {
        let mut scanned = 0;
        while scanned < (2 * inner.clock.len()) {
            if inner.clock.is_empty() {
                return Ok(());
            }
            let hand = inner.hand % inner.clock.len();
            let bid = inner.clock[hand];

            // 0 => second chance, 1 => victim, 2 => stale ring entry.
            let state: u8 = match inner.slots.get_mut(&bid) {
                Some(slot) if slot.pinned > 0 => 0,
                Some(slot) if slot.referenced => {
                    slot.referenced = false;
                    0
                }
                Some(_) => 1,
                None => 2,
            };

            if state == 2 {
                inner.clock.remove(hand);
                continue;
            }

            if state == 1 {
                let slot = inner.slots.remove(&bid).unwrap();
                if slot.dirty {
                    self.write_disk(bid, &slot.data)?;
                }
                inner.clock.remove(hand);
                inner.hand = hand;
                return Ok(());
            }

            inner.hand = hand + 1;
            scanned += 1;
        }
        // every slot is pinned or hot, let the cache overshoot.
        Ok(())
    }
}
