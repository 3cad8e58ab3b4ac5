//! Disk primitives for plotkit table files.
//!
//! The plotting phases keep each table in one flat file of fixed-width
//! entries and rewrite those files in place.  This crate provides the small
//! [`Disk`] interface they need (positioned reads and writes plus truncation),
//! a POSIX implementation in [`FileDisk`], and an in-memory implementation in
//! [`MemoryDisk`] used by tests and small runs.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Once;

use fdlimit::{raise_fd_limit, Outcome::LimitRaised};
use tracing::warn;

use crate::error::StorageError;

pub mod error;
pub mod memory_impl;
pub mod metrics;
pub mod posixio_impl;


pub use memory_impl::MemoryDisk;
pub use posixio_impl::FileDisk;

/// Random access to one open file.
///
/// Reads and writes address the file by byte offset.  A read must be
/// satisfied in full: reading past the end of the file is an error rather
/// than a short result.  Writing past the end extends the file, filling any
/// gap with zeros.
pub trait Disk {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Writes all of `data` starting at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Shrinks (or extends with zeros) the file to exactly `len` bytes.
    fn truncate(&mut self, len: u64) -> Result<(), StorageError>;

    /// Returns the file's size in bytes.
    fn size(&self) -> Result<u64, StorageError>;

    /// Returns a name for the file, for log messages.
    fn name(&self) -> String;
}

impl<D> Disk for Box<D>
where
    D: Disk + ?Sized,
{
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        (**self).write_at(offset, data)
    }

    fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        (**self).truncate(len)
    }

    fn size(&self) -> Result<u64, StorageError> {
        (**self).size()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

impl<D> Disk for &mut D
where
    D: Disk + ?Sized,
{
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        (**self).write_at(offset, data)
    }

    fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        (**self).truncate(len)
    }

    fn size(&self) -> Result<u64, StorageError> {
        (**self).size()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

/// Checks that `name` can be used as a file name inside a scratch directory.
pub fn check_scratch_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        Err(StorageError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Writes `content` to a new file at `path` and flushes it to disk.
///
/// Fails if the file already exists.
pub fn write_new_file<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<(), StorageError> {
    let mut f = OpenOptions::new().create_new(true).write(true).open(path)?;
    f.write_all(content)?;
    f.sync_all()?;
    Ok(())
}

/// Raise the fd limit so that the external sort can keep one scratch file
/// open per bucket.  This is a no-op on Windows.
fn init_fd_limit() {
    match raise_fd_limit() {
        Ok(LimitRaised { from, to }) => {
            const WARN_THRESHOLD: u64 = 1 << 12;
            if to < WARN_THRESHOLD {
                warn!("Raised fd limit from {} to {}. It's still low -- sorts with many buckets may run out of file descriptors (try increasing the hard limit in limits.conf).", from, to);
            }
        }
        Ok(_) => { /* not on unix */ }
        Err(e) => {
            warn!("Failed to raise fd limit: {}", e);
        }
    }
}

/// Performs storage initialization.
///
/// On Unix, this raises the process's file descriptor limit from its "soft"
/// to its "hard" limit.  The function is idempotent; opening or creating a
/// [`FileDisk`] calls it automatically.  It can log, so initialize logging
/// before calling it.
pub fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        crate::metrics::describe_disk_metrics();
        init_fd_limit();
    });
}
