//! Implementation of [`Disk`] using memory.
//!
//! This is useful for tests and for tables small enough to keep in RAM, not
//! as a replacement for [`FileDisk`](crate::FileDisk) on real plots.

use ::metrics::counter;

use crate::metrics::{
    READS_FAILED, READS_SUCCESS, TOTAL_BYTES_READ, TOTAL_BYTES_WRITTEN, TRUNCATES, WRITES_SUCCESS,
};
use crate::{Disk, StorageError};

/// A growable in-memory file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryDisk {
    name: String,
    data: Vec<u8>,
}

impl MemoryDisk {
    /// Creates an empty file called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Vec::new(),
        }
    }

    /// Creates a file called `name` that initially holds `data`.
    pub fn with_data(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Returns the file's contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the file's contents, consuming the file.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Disk for MemoryDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let size = self.data.len() as u64;
        let end = offset.checked_add(buf.len() as u64);
        match end {
            Some(end) if end <= size => {
                let start = offset as usize;
                buf.copy_from_slice(&self.data[start..start + buf.len()]);
                counter!(TOTAL_BYTES_READ).increment(buf.len() as u64);
                counter!(READS_SUCCESS).increment(1);
                Ok(())
            }
            _ => {
                counter!(READS_FAILED).increment(1);
                Err(StorageError::ShortRead {
                    offset,
                    length: buf.len(),
                    size,
                })
            }
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let start = offset as usize;
        let end = start + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        counter!(TOTAL_BYTES_WRITTEN).increment(data.len() as u64);
        counter!(WRITES_SUCCESS).increment(1);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        self.data.resize(len as usize, 0);
        counter!(TRUNCATES).increment(1);
        Ok(())
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(self.data.len() as u64)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
