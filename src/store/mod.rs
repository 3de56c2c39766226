//! Module implement the storage engine's public face.
//!
//! A [Db] value manages one append-only file holding any number of named
//! key-value stores. Open a store with [Db::open_store], read and write
//! documents through the returned [KvsHandle], and make the state
//! durable with [Db::commit]. Handles are cheap to clone and safe to use
//! from concurrent threads.
//!
//! Multi-version-concurrency is root-swap based: every commit publishes
//! a fresh immutable view of the file, readers keep whichever view they
//! started with. [KvsHandle::snapshot] pins such a view permanently,
//! either at a committed seqno from the header back-chain, at the
//! current in-memory state ([INMEM_SNAPSHOT]), or empty (seqno 0).
//! [KvsHandle::rollback] truncates a store's logical history to an older
//! seqno. [Db::begin_transaction] scopes writes into a private
//! write-ahead partition with read-committed or read-uncommitted
//! visibility. [Db::compact] rewrites the live document set into a fresh
//! file while writers continue.

use std::time;

use crate::{trie, Error, Result};

mod compact;
mod file;
mod header;
mod iter;
mod kvs;
mod txn;

pub use file::{Db, DbInfo};
pub use header::{Catalog, CommitHeader, StoreCat};
pub use iter::{Iter, SeqIter};
pub use kvs::{KvsHandle, KvsInfo, SnapMarker};
pub use txn::Transaction;

/// Seqno sentinel: snapshot over the current in-memory state.
pub const INMEM_SNAPSHOT: u64 = u64::MAX;

/// Name under which the nameless store is kept.
pub const DEFAULT_STORE: &str = "default";

/// Default buffer-cache budget, in bytes.
pub const BUFFERCACHE_SIZE: usize = 8 * 1024 * 1024;

/// Default write-ahead-buffer flush threshold, in entries.
pub const WAL_THRESHOLD: usize = 4096;

/// Default block size, in bytes.
pub const BLOCKSIZE: usize = 4096;

/// Default background compactor wake-up interval, in seconds.
pub const COMPACTOR_SLEEP: u64 = 15;

/// Default stale-space fraction, in percent, that triggers an automatic
/// compaction.
pub const COMPACTION_THRESHOLD: u8 = 30;

/// Commit behavior for [Db::commit].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitMode {
    /// Persist the write-ahead-buffer as it is; entries are flushed into
    /// the trees only once they outgrow the configured threshold.
    Normal,
    /// Flush every committed entry into the trees before writing the
    /// commit header.
    ManualWalFlush,
}

/// Transaction isolation for [Db::begin_transaction].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsolationLevel {
    /// See committed writes plus the transaction's own.
    ReadCommitted,
    /// Additionally see other live transactions' uncommitted writes.
    ReadUncommitted,
}

/// When to run compaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompactionMode {
    /// Only on explicit [Db::compact] calls.
    Manual,
    /// A background thread compacts whenever the stale-space fraction
    /// crosses [Config::compaction_threshold].
    Auto,
}

/// Iterator behavior flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct IterFlags {
    /// Skip tombstones instead of yielding them.
    pub no_deletes: bool,
}

/// Target of [Iter::seek]: the smallest entry at-or-above the key, or
/// the largest entry at-or-below it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeekTo {
    Ge,
    Le,
}

/// Configuration for [Db::open]. Use the `set_*` methods to tune the
/// defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// Buffer-cache budget in bytes. A minimum working set is always
    /// cached.
    pub buffercache_size: usize,
    /// Number of committed write-ahead entries that triggers a flush
    /// into the trees at the next commit.
    pub wal_threshold: usize,
    /// Create the file when it does not exist.
    pub create: bool,
    /// Manual or automatic compaction.
    pub compaction_mode: CompactionMode,
    /// Stale-space percentage triggering automatic compaction.
    pub compaction_threshold: u8,
    /// Automatic compactor wake-up interval, in seconds.
    pub compactor_sleep_duration: u64,
    /// Allow stores other than the default one.
    pub multi_kv_instances: bool,
    /// Tombstones younger than this many seconds survive compaction;
    /// zero purges every tombstone.
    pub purging_interval: u64,
    /// Block size in bytes.
    pub blocksize: usize,
    /// Key-chunk width of the trie, in bytes.
    pub chunksize: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            buffercache_size: BUFFERCACHE_SIZE,
            wal_threshold: WAL_THRESHOLD,
            create: true,
            compaction_mode: CompactionMode::Manual,
            compaction_threshold: COMPACTION_THRESHOLD,
            compactor_sleep_duration: COMPACTOR_SLEEP,
            multi_kv_instances: true,
            purging_interval: 0,
            blocksize: BLOCKSIZE,
            chunksize: trie::CHUNKSIZE,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn set_buffercache_size(&mut self, size: usize) -> &mut Self {
        self.buffercache_size = size;
        self
    }

    pub fn set_wal_threshold(&mut self, n: usize) -> &mut Self {
        self.wal_threshold = n;
        self
    }

    pub fn set_create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    pub fn set_compaction_mode(&mut self, mode: CompactionMode) -> &mut Self {
        self.compaction_mode = mode;
        self
    }

    pub fn set_compaction_threshold(&mut self, percent: u8) -> &mut Self {
        self.compaction_threshold = percent;
        self
    }

    pub fn set_compactor_sleep_duration(&mut self, secs: u64) -> &mut Self {
        self.compactor_sleep_duration = secs;
        self
    }

    pub fn set_multi_kv_instances(&mut self, multi: bool) -> &mut Self {
        self.multi_kv_instances = multi;
        self
    }

    pub fn set_purging_interval(&mut self, secs: u64) -> &mut Self {
        self.purging_interval = secs;
        self
    }

    pub fn set_blocksize(&mut self, blocksize: usize) -> &mut Self {
        self.blocksize = blocksize;
        self
    }

    pub fn set_chunksize(&mut self, chunksize: usize) -> &mut Self {
        self.chunksize = chunksize;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.blocksize < 1024 || self.blocksize > (1 << 20) {
            err_at!(InvalidInput, msg: "blocksize {}", self.blocksize)?
        }
        if self.chunksize < 4 || self.chunksize > 64 {
            err_at!(InvalidInput, msg: "chunksize {}", self.chunksize)?
        }
        if self.compaction_threshold > 100 {
            err_at!(InvalidInput, msg: "compaction threshold {}%", self.compaction_threshold)?
        }
        Ok(())
    }
}

// seconds since unix epoch.
pub(crate) fn unix_now() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<'a> arbitrary::Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        let mut config = Config::default();
        config.buffercache_size = *u.choose(&[0, 1 << 20, 8 << 20])?;
        config.wal_threshold = *u.choose(&[8, 256, 1024, 4096])?;
        config.blocksize = *u.choose(&[4096, 8192])?;
        config.chunksize = *u.choose(&[4, 8, 16])?;
        Ok(config)
    }
}
