use std::path::PathBuf;

use plotkit_storage::error::StorageError;
use thiserror::Error;

/// An error that stops a backpropagation run.
///
/// None of these are recoverable: table files may already be partly
/// rewritten when one is returned, so the plot has to be started over.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum Phase2Error {
    /// Reading, writing or truncating a table or scratch file failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The run was configured inconsistently.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The external sort failed.
    #[error("Sort error: {0}")]
    Sort(#[from] SortError),

    /// A kept entry refers past the end of the table below it.
    #[error("entry {index} of table {table} refers to positions {pos} and {pos} + {offset}, but the table below has {size} entries")]
    DanglingReference {
        table: usize,
        index: u64,
        pos: u64,
        offset: u64,
        size: u64,
    },
}

/// A problem with the parameters of a run, found before any table is
/// touched.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `k` is outside the supported range.
    #[error("k = {k} is outside the supported range {min}..={max}")]
    InvalidK { k: u8, min: u8, max: u8 },

    /// The bucket count is not `1 << log_num_buckets`.
    #[error("{num_buckets} buckets is not 2^{log_num_buckets}")]
    BucketMismatch {
        num_buckets: u32,
        log_num_buckets: u32,
    },

    /// More bucket bits than there are position bits to take them from.
    #[error("2^{log_num_buckets} buckets need more than the {k} position bits")]
    TooManyBuckets { log_num_buckets: u32, k: u8 },

    /// An entry width can't hold the fields stored in it.
    #[error("{size}-byte entries of table {table} can't hold {needed_bits} bits")]
    EntryTooSmall {
        table: usize,
        size: usize,
        needed_bits: usize,
    },

    /// The memory budget can't hold even the smallest working set.
    #[error("{available} bytes of memory is too small, at least {needed} bytes are needed")]
    MemoryTooSmall { available: usize, needed: usize },

    /// A table file is shorter than its entry count says.
    #[error("table {table} should hold {expected} bytes but its file {name} has {actual}")]
    TableTruncated {
        table: usize,
        name: String,
        expected: u64,
        actual: u64,
    },

    /// A table references more entries than the table below it has.
    #[error("table {table} has {size} entries, more than 2^{k} positions can address")]
    TableTooLarge { table: usize, size: u64, k: u8 },

    /// The directory for scratch files is missing.
    #[error("scratch directory {} does not exist", .0.display())]
    MissingTmpDir(PathBuf),
}

/// An error from the external sort.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum SortError {
    /// Reading back or spilling a bucket failed.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// The cache can't hold one entry per bucket.
    #[error("a {cache_bytes}-byte sort cache is too small, at least {needed} bytes are needed")]
    CacheTooSmall { cache_bytes: usize, needed: usize },

    /// A bucket grew larger than the memory available to sort it.
    #[error("bucket {bucket} holds {bytes} bytes, but only {capacity} bytes are available to sort it; use more memory or more buckets")]
    BucketTooLarge {
        bucket: usize,
        bytes: u64,
        capacity: usize,
    },

    /// Entries must be read back in order, one after another.
    #[error("read at byte {position} but the next entry starts at byte {expected}")]
    OutOfOrderRead { position: u64, expected: u64 },

    /// Read past the last entry added to the sort.
    #[error("read at byte {position} is past the end of the sorted data ({total} bytes)")]
    ReadPastEnd { position: u64, total: u64 },

    /// Entries can't be added once the cache has been flushed.
    #[error("entry added after the sort cache was flushed")]
    AddAfterFlush,

    /// Entries can't be read back until the cache has been flushed.
    #[error("entries read before the sort cache was flushed")]
    ReadBeforeFlush,
}
