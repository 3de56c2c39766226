//! Banyan is an embedded, single-process, append-only key-value storage
//! engine. A single file can hold several named key-value stores, each
//! supporting ordered key iteration, sequence-number iteration,
//! crash-consistent commits, MVCC snapshots (durable and in-memory),
//! seqno based rollback, multi-reader transactions and online compaction.
//!
//! Design in a nut-shell
//! ---------------------
//!
//! * The file is an append-only stream of fixed size blocks. A one byte
//!   marker classifies every block as document-block, node-block or
//!   commit-header.
//! * Documents are packed into document-blocks as self delimited,
//!   CRC protected records, via the [dlog] module.
//! * Each store indexes its documents twice: by key, through a trie of
//!   copy-on-write B+trees ([trie] module over [btree] module), and by
//!   seqno through a plain B+tree.
//! * Recent writes are held in an in-memory write-ahead-buffer ([wal]
//!   module) until a commit flushes them into the trees.
//! * A commit writes a header-block that roots the entire visible state
//!   and chains to the previous header. Opening a file scans backward
//!   for the newest valid header, which makes commits atomic and
//!   recovery immune to torn or garbage tails.
//! * Snapshots bind to an older header, rollback adopts an older header
//!   as the new head, and compaction copies the live document set into a
//!   fresh file while writers continue.
//!
//! Refer to [Db] for the entry point into the api.

use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// err_at!(ReadFail, msg: "missing block {}", bid);
/// ```
///
/// ```ignore
/// err_at!(IOError, fs::read(file_path));
/// ```
///
/// ```ignore
/// err_at!(IOError, fs::read(file_path), "reading {:?}", file_path);
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Short form to assert that a buffer holds at least `want` more bytes.
#[macro_export]
macro_rules! check_remaining {
    ($buf:expr, $want:expr, $msg:expr) => {
        if $buf.len() < $want {
            err_at!(
                FileCorruption, msg: "insufficient input {}/{} ({})", $buf.len(), $want, $msg
            )
        } else {
            Ok(())
        }
    };
}

pub mod bcache;
pub mod btree;
pub mod dlog;
pub mod store;
pub mod trie;
pub mod util;
pub mod wal;

pub use dlog::Doc;
pub use store::{
    Catalog, CommitMode, Config, Db, DbInfo, IsolationLevel, IterFlags, KvsHandle,
    KvsInfo, SeekTo, SnapMarker, StoreCat, Transaction, INMEM_SNAPSHOT,
};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that are returned by this package's api.
///
/// Each variant carries a prefix, typically the `file:line-no` where the
/// error was detected, and a message.
#[derive(Debug, Clone)]
pub enum Error {
    Fatal(String, String),
    IOError(String, String),
    OpenFail(String, String),
    NoSuchFile(String, String),
    WriteFail(String, String),
    ReadFail(String, String),
    FailConvert(String, String),
    FailCbor(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
    InvalidInput(String, String),
    InvalidFile(String, String),
    ChecksumError(String, String),
    FileCorruption(String, String),
    KeyNotFound(String, String),
    NoDbInstance(String, String),
    IteratorFail(String, String),
    FailByTransaction(String, String),
    FailByCompaction(String, String),
    RonlyViolation(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, m) => write!(f, "{} Fatal: {}", p, m),
            IOError(p, m) => write!(f, "{} IOError: {}", p, m),
            OpenFail(p, m) => write!(f, "{} OpenFail: {}", p, m),
            NoSuchFile(p, m) => write!(f, "{} NoSuchFile: {}", p, m),
            WriteFail(p, m) => write!(f, "{} WriteFail: {}", p, m),
            ReadFail(p, m) => write!(f, "{} ReadFail: {}", p, m),
            FailConvert(p, m) => write!(f, "{} FailConvert: {}", p, m),
            FailCbor(p, m) => write!(f, "{} FailCbor: {}", p, m),
            IPCFail(p, m) => write!(f, "{} IPCFail: {}", p, m),
            ThreadFail(p, m) => write!(f, "{} ThreadFail: {}", p, m),
            InvalidInput(p, m) => write!(f, "{} InvalidInput: {}", p, m),
            InvalidFile(p, m) => write!(f, "{} InvalidFile: {}", p, m),
            ChecksumError(p, m) => write!(f, "{} ChecksumError: {}", p, m),
            FileCorruption(p, m) => write!(f, "{} FileCorruption: {}", p, m),
            KeyNotFound(p, m) => write!(f, "{} KeyNotFound: {}", p, m),
            NoDbInstance(p, m) => write!(f, "{} NoDbInstance: {}", p, m),
            IteratorFail(p, m) => write!(f, "{} IteratorFail: {}", p, m),
            FailByTransaction(p, m) => write!(f, "{} FailByTransaction: {}", p, m),
            FailByCompaction(p, m) => write!(f, "{} FailByCompaction: {}", p, m),
            RonlyViolation(p, m) => write!(f, "{} RonlyViolation: {}", p, m),
        }
    }
}

impl error::Error for Error {}
