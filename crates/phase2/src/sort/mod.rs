//! External, bucketed sort of fixed-width entries.
//!
//! A [`SortManager`] sorts more entries than fit in memory.  Entries are
//! distributed into `2^log_num_buckets` buckets by the bits that start at
//! `begin_bits`, so that every entry in bucket `b` sorts before every entry in
//! bucket `b + 1`.  Each bucket owns an equal slice of the cache; when a
//! bucket's slice fills up it is appended to the bucket's scratch file.
//!
//! Once all entries have been added and [`SortManager::flush_cache`] has been
//! called, [`SortManager::read_entry`] returns the entries in ascending order
//! of the bits from `begin_bits` to the end of the entry.  Entries that tie
//! on those bits are ordered by their first `begin_bits` bits, so only
//! identical entries compare equal and the output doesn't depend on the
//! cache size or the number of buckets.  Buckets are loaded back one at a
//! time and sorted in place, so every bucket must fit in the cache.

use std::path::PathBuf;
use std::time::Instant;

use ::metrics::counter;
use plotkit_storage::{check_scratch_name, error::StorageError, Disk, FileDisk};
use tracing::{debug, warn};

use crate::bits::{cmp_before_bit, cmp_from_bit, slice_u64};
use crate::error::SortError;
use crate::metrics::{SORT_BUCKETS_LOADED, SORT_SPILLS};

pub mod records;

use records::sort_records;

/// Parameters of a [`SortManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortParams {
    /// Number of buckets, which must be `1 << log_num_buckets`.
    pub num_buckets: usize,
    pub log_num_buckets: u32,
    /// Width of every entry, in bytes.
    pub entry_size: usize,
    /// Number of leading bits of each entry that don't take part in the
    /// ordering.
    pub begin_bits: usize,
    /// Directory for the scratch files.
    pub tmp_dir: PathBuf,
    /// Name prefix for the scratch files.  Must be unique among concurrent
    /// sorts in `tmp_dir`.
    pub file_prefix: String,
}

impl SortParams {
    fn bucket_path(&self, bucket: usize) -> PathBuf {
        self.tmp_dir
            .join(format!("{}.sort_bucket_{:03}.tmp", self.file_prefix, bucket))
    }
}

#[derive(Default)]
struct Bucket {
    /// Entries waiting in this bucket's slice of the cache.
    buffered: usize,
    /// Spilled entries, created on the first spill.
    file: Option<FileDisk>,
    /// Bytes written to `file`.
    spilled: u64,
}

/// Where reading back has got to.
#[derive(Debug, Default)]
struct ReadState {
    /// Next bucket to load.
    next_bucket: usize,
    /// Position of the first entry of the loaded bucket.
    loaded_start: u64,
    /// Position just past the last entry of the loaded bucket.
    loaded_end: u64,
    /// Position the next `read_entry` must ask for.
    next_position: u64,
}

/// Bucketed external sort over a borrowed cache.
pub struct SortManager<'a> {
    cache: &'a mut [u8],
    params: SortParams,
    /// Entries each bucket can buffer before it spills.
    bucket_capacity: usize,
    buckets: Vec<Bucket>,
    num_entries: u64,
    /// `Some` once the cache has been flushed.
    read: Option<ReadState>,
}

impl<'a> SortManager<'a> {
    /// Creates a sort that buffers entries in `cache`.
    ///
    /// Fails if `cache` can't give every bucket room for at least one entry
    /// or if the scratch file prefix is not a valid file name.
    pub fn new(cache: &'a mut [u8], params: SortParams) -> Result<Self, SortError> {
        assert!(params.entry_size > 0);
        assert_eq!(params.num_buckets, 1 << params.log_num_buckets);
        assert!(params.begin_bits + params.log_num_buckets as usize <= params.entry_size * 8);
        check_scratch_name(&params.file_prefix)?;

        let bucket_capacity = cache.len() / params.entry_size / params.num_buckets;
        if bucket_capacity == 0 {
            return Err(SortError::CacheTooSmall {
                cache_bytes: cache.len(),
                needed: params.entry_size * params.num_buckets,
            });
        }
        let buckets = (0..params.num_buckets).map(|_| Bucket::default()).collect();
        Ok(Self {
            cache,
            params,
            bucket_capacity,
            buckets,
            num_entries: 0,
            read: None,
        })
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    fn bucket_of(&self, entry: &[u8]) -> usize {
        slice_u64(
            entry,
            self.params.begin_bits,
            self.params.log_num_buckets as usize,
        ) as usize
    }

    /// Adds `entry`, which must be exactly `entry_size` bytes, to the sort.
    pub fn add_to_cache(&mut self, entry: &[u8]) -> Result<(), SortError> {
        if self.read.is_some() {
            return Err(SortError::AddAfterFlush);
        }
        let entry_size = self.params.entry_size;
        assert_eq!(entry.len(), entry_size);

        let index = self.bucket_of(entry);
        let bucket = &mut self.buckets[index];
        let start = (index * self.bucket_capacity + bucket.buffered) * entry_size;
        self.cache[start..start + entry_size].copy_from_slice(entry);
        bucket.buffered += 1;
        self.num_entries += 1;

        if bucket.buffered == self.bucket_capacity {
            self.spill(index)?;
        }
        Ok(())
    }

    /// Appends the buffered entries of bucket `index` to its scratch file.
    fn spill(&mut self, index: usize) -> Result<(), StorageError> {
        let Self {
            cache,
            params,
            bucket_capacity,
            buckets,
            ..
        } = self;
        let bucket = &mut buckets[index];
        if bucket.buffered == 0 {
            return Ok(());
        }

        let file = match bucket.file.as_mut() {
            Some(file) => file,
            None => {
                let path = params.bucket_path(index);
                if path.exists() {
                    warn!("removing stale sort bucket {}", path.display());
                    StorageError::ignore_notfound(
                        std::fs::remove_file(&path).map_err(StorageError::from),
                    )?;
                }
                bucket.file.insert(FileDisk::create_scratch(&path)?)
            }
        };

        let start = index * *bucket_capacity * params.entry_size;
        let len = bucket.buffered * params.entry_size;
        file.write_at(bucket.spilled, &cache[start..start + len])?;
        bucket.spilled += len as u64;
        bucket.buffered = 0;
        counter!(SORT_SPILLS).increment(1);
        Ok(())
    }

    /// Writes every buffered entry to disk.  After this, no more entries can
    /// be added and [`read_entry`](Self::read_entry) may be called.
    pub fn flush_cache(&mut self) -> Result<(), SortError> {
        if self.read.is_some() {
            return Ok(());
        }
        let start = Instant::now();
        for index in 0..self.buckets.len() {
            self.spill(index)?;
        }
        debug!(
            "flushed {} entries of {} into {} buckets in {:.2?}",
            self.num_entries,
            self.params.file_prefix,
            self.buckets.iter().filter(|b| b.spilled > 0).count(),
            start.elapsed()
        );
        self.read = Some(ReadState::default());
        Ok(())
    }

    /// Returns the entry at byte `position` of the sorted output.
    ///
    /// Entries must be read in order: the first call asks for position 0 and
    /// each later call for the position just after the previous entry.
    pub fn read_entry(&mut self, position: u64) -> Result<&[u8], SortError> {
        let entry_size = self.params.entry_size as u64;
        let total = self.num_entries * entry_size;
        let Some(read) = &mut self.read else {
            return Err(SortError::ReadBeforeFlush);
        };
        if position >= total {
            return Err(SortError::ReadPastEnd { position, total });
        }
        if position != read.next_position {
            return Err(SortError::OutOfOrderRead {
                position,
                expected: read.next_position,
            });
        }

        while position >= read.loaded_end {
            let index = read.next_bucket;
            let bytes = Self::load_bucket(
                &mut *self.cache,
                &self.params,
                &mut self.buckets[index],
                index,
            )?;
            read.next_bucket += 1;
            read.loaded_start = read.loaded_end;
            read.loaded_end += bytes;
        }

        read.next_position += entry_size;
        let offset = (position - read.loaded_start) as usize;
        Ok(&self.cache[offset..offset + entry_size as usize])
    }

    /// Reads bucket `index` into the start of `cache` and sorts it, returning
    /// its size in bytes.  The bucket's scratch file is deleted.
    fn load_bucket(
        cache: &mut [u8],
        params: &SortParams,
        bucket: &mut Bucket,
        index: usize,
    ) -> Result<u64, SortError> {
        let Some(file) = bucket.file.take() else {
            return Ok(0);
        };
        let entry_size = params.entry_size;
        let capacity = cache.len() / entry_size * entry_size;
        if bucket.spilled > capacity as u64 {
            return Err(SortError::BucketTooLarge {
                bucket: index,
                bytes: bucket.spilled,
                capacity,
            });
        }

        let start = Instant::now();
        let data = &mut cache[..bucket.spilled as usize];
        file.read_at(0, data)?;
        drop(file);
        let begin_bits = params.begin_bits;
        sort_records(data, entry_size, |a, b| {
            cmp_from_bit(a, b, begin_bits).then_with(|| cmp_before_bit(a, b, begin_bits))
        });
        counter!(SORT_BUCKETS_LOADED).increment(1);
        debug!(
            "sorted bucket {index} of {} ({} entries) in {:.2?}",
            params.file_prefix,
            bucket.spilled as usize / entry_size,
            start.elapsed()
        );
        Ok(bucket.spilled)
    }
}
