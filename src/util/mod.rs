//! Module implement common utility functions and types.

use cbordata::{Cbor, FromCbor, IntoCbor};

use std::{ffi, fs, path};

use crate::{Error, Result};

pub mod spinlock;
pub mod thread;

pub use spinlock::Spinlock;
pub use thread::Thread;

/// Serialize `val` into its cbor byte-string.
pub fn into_cbor_bytes<T>(val: T) -> Result<Vec<u8>>
where
    T: IntoCbor,
{
    let cbor = err_at!(FailCbor, val.into_cbor())?;
    let mut out = Vec::default();
    err_at!(FailCbor, cbor.encode(&mut out))?;
    Ok(out)
}

/// Deserialize a value of type `T` from the head of `data`. Return the
/// value and the number of bytes it consumed.
pub fn from_cbor_bytes<T>(data: &[u8]) -> Result<(T, usize)>
where
    T: FromCbor,
{
    let mut reader = data;
    let (cbor, n) = err_at!(FailCbor, Cbor::decode(&mut reader))?;
    let val = err_at!(FailCbor, T::from_cbor(cbor))?;
    Ok((val, n))
}

// open a file for read/write, optionally creating it and its parent dir.
pub fn open_file_rw(file: &ffi::OsStr, create: bool) -> Result<fs::File> {
    let os_file = path::Path::new(file);

    if create {
        if let Some(parent) = os_file.parent() {
            err_at!(IOError, fs::create_dir_all(parent))?;
        }
    } else if !os_file.exists() {
        err_at!(NoSuchFile, msg: "{:?}", file)?;
    }

    let mut opts = fs::OpenOptions::new();
    err_at!(
        OpenFail,
        opts.read(true).write(true).create(create).open(os_file),
        "file {:?}",
        file
    )
}

/// Encode an u64 value as 8 big-endian bytes.
#[inline]
pub fn to_be_bytes(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode 8 big-endian bytes into an u64 value.
#[inline]
pub fn from_be_bytes(buf: &[u8]) -> Result<u64> {
    use std::convert::TryInto;

    let buf: [u8; 8] = err_at!(FailConvert, buf[..8].try_into())?;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
