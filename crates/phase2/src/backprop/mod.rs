//! Backpropagation over the seven tables of a plot.
//!
//! Phase 1 leaves every table complete, including entries that no entry of
//! table 7 depends on.  Walking from table 7 down to table 2, each table is
//! scanned twice:
//!
//! 1. The first scan marks, in a [`LivenessSet`] over the table below, the
//!    two entries that every kept entry refers to.  Every entry of table 7 is
//!    kept; an entry of a lower table is kept if the scan of the table above
//!    marked it.
//! 2. A [`RankIndex`] over the new marks maps old positions to compacted
//!    ones.  The second scan drops the entries the first scan skipped and
//!    rewrites the references of the others.  Table 7 is rewritten in place.
//!    Tables 2 to 6 are re-encoded as `sort_key | pos | offset`, where
//!    `sort_key` is the entry's rank among the kept entries, sorted by
//!    `pos` through the external sort and written back over the table.
//!
//! Table 1 holds no references, so it is only compacted.

use std::ops::{Index, IndexMut};
use std::time::Instant;

use ::metrics::counter;
use plotkit_storage::Disk;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bits::{slice_u64, EntryWriter};
use crate::config::BackpropConfig;
use crate::entry_sizes::{EntrySizes, NUM_TABLES, OFFSET_SIZE};
use crate::error::{ConfigError, Phase2Error};
use crate::liveness::LivenessSet;
use crate::metrics::{ENTRIES_DROPPED, ENTRIES_KEPT};
use crate::rank::RankIndex;
use crate::sort::{SortManager, SortParams};
use crate::streamer::TableStreamer;

/// Number of entries in each table, indexed by table number (index 0 is
/// unused).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSizes([u64; NUM_TABLES + 1]);

impl TableSizes {
    /// Sizes of tables 1 to 7.
    pub fn new(sizes: [u64; NUM_TABLES]) -> Self {
        let mut all = [0; NUM_TABLES + 1];
        all[1..].copy_from_slice(&sizes);
        Self(all)
    }

    /// Iterates over `(table, size)` for tables 1 to 7.
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.0.iter().copied().enumerate().skip(1)
    }
}

impl Index<usize> for TableSizes {
    type Output = u64;

    fn index(&self, table: usize) -> &u64 {
        &self.0[table]
    }
}

impl IndexMut<usize> for TableSizes {
    fn index_mut(&mut self, table: usize) -> &mut u64 {
        &mut self.0[table]
    }
}

/// Runs backpropagation over the tables in `disks[1..=7]`, whose entry
/// counts are `table_sizes`, using `memory` as the whole working memory.
///
/// On success every table file has been rewritten in place and truncated to
/// its new size, and the new sizes are returned (table 7 keeps its size).
/// On failure the tables may be partly rewritten and should be discarded.
///
/// Tables 2 to 6 may hold at most `2^k` entries.  Table 1 may be larger; its
/// entries that table 2 cannot reach are dropped.
pub fn run_backpropagation<D>(
    memory: &mut [u8],
    disks: &mut [D; NUM_TABLES + 1],
    table_sizes: &TableSizes,
    config: &BackpropConfig,
) -> Result<TableSizes, Phase2Error>
where
    D: Disk,
{
    crate::init();
    config.validate(memory.len())?;
    let entry_sizes = config.entry_sizes();
    check_tables(&disks[..], table_sizes, &entry_sizes, config)?;

    let start = Instant::now();
    let k = config.k as usize;
    let mut new_sizes = TableSizes::default();
    new_sizes[NUM_TABLES] = table_sizes[NUM_TABLES];

    // Nothing is dropped from table 7.
    let mut current = LivenessSet::all_live(table_sizes[NUM_TABLES]);
    for table in (2..=NUM_TABLES).rev() {
        info!("backpropagating on table {table}");
        let entry_size = entry_sizes.get(table);
        let size = table_sizes[table];
        let half = memory.len() / 2;
        let (read_buffer, sort_cache) = memory.split_at_mut(half - half % entry_size);
        let disk = &mut disks[table];

        let scan_start = Instant::now();
        let mut next = LivenessSet::new(table_sizes[table - 1]);
        let scan = TableScan {
            table,
            size,
            entry_size,
            k,
        };
        let kept = scan.mark_live(&*disk, &current, &mut next, read_buffer)?;
        info!(
            "scanned table {table} in {:.2?}: keeping {kept} of {size} entries",
            scan_start.elapsed()
        );

        let rewrite_start = Instant::now();
        let index = RankIndex::new(&next);
        if table == NUM_TABLES {
            scan.rewrite_in_place(disk, &index, read_buffer)?;
            info!(
                "rewrote table {table} in place in {:.2?}",
                rewrite_start.elapsed()
            );
        } else {
            let written =
                scan.sort_by_pos(disk, &current, &index, read_buffer, sort_cache, config)?;
            debug_assert_eq!(written, kept);
            new_sizes[table] = written;
            info!(
                "table {table} new size: {written} (sorted and written in {:.2?})",
                rewrite_start.elapsed()
            );
        }
        counter!(ENTRIES_KEPT).increment(kept);
        counter!(ENTRIES_DROPPED).increment(size - kept);

        current = next;
    }

    info!("compacting table 1");
    let size = table_sizes[1];
    let kept = compact_table(&mut disks[1], size, entry_sizes.get(1), &current, memory)?;
    counter!(ENTRIES_KEPT).increment(kept);
    counter!(ENTRIES_DROPPED).increment(size - kept);
    new_sizes[1] = kept;
    info!("table 1 new size: {kept}");

    info!("backpropagation finished in {:.2?}", start.elapsed());
    Ok(new_sizes)
}

/// Checks the tables against their sizes before anything is modified.
fn check_tables<D>(
    disks: &[D],
    table_sizes: &TableSizes,
    entry_sizes: &EntrySizes,
    config: &BackpropConfig,
) -> Result<(), Phase2Error>
where
    D: Disk,
{
    if !config.tmp_dir.is_dir() {
        return Err(ConfigError::MissingTmpDir(config.tmp_dir.clone()).into());
    }
    for (table, size) in table_sizes.iter() {
        // Tables 2 to 6 are rewritten with `k`-bit positions.  Entries of
        // table 1 past `2^k` are unreachable and get dropped.
        if (2..NUM_TABLES).contains(&table) && size > 1u64 << config.k {
            return Err(ConfigError::TableTooLarge {
                table,
                size,
                k: config.k,
            }
            .into());
        }
        let disk = &disks[table];
        let expected = size.saturating_mul(entry_sizes.get(table) as u64);
        let actual = disk.size()?;
        if actual < expected {
            return Err(ConfigError::TableTruncated {
                table,
                name: disk.name(),
                expected,
                actual,
            }
            .into());
        }
    }
    Ok(())
}

/// Both scans of one of tables 2 to 7.
///
/// The scans read the table through [`TableStreamer`]s built from the same
/// sizes, so they see the same entries with the same indexes.
struct TableScan {
    table: usize,
    size: u64,
    entry_size: usize,
    k: usize,
}

impl TableScan {
    /// Bit at which `pos | offset` starts: table 7 entries lead with `f7`.
    fn ref_start(&self) -> usize {
        if self.table == NUM_TABLES {
            self.k
        } else {
            0
        }
    }

    fn read_ref(&self, entry: &[u8]) -> (u64, u64) {
        let start = self.ref_start();
        (
            slice_u64(entry, start, self.k),
            slice_u64(entry, start + self.k, OFFSET_SIZE),
        )
    }

    fn streamer(&self, buffer: &[u8]) -> TableStreamer {
        TableStreamer::new(self.size, self.entry_size, buffer.len())
    }

    /// First scan: marks in `next` the entries that the entries kept by
    /// `current` refer to.  Returns the number of entries kept.
    fn mark_live<D>(
        &self,
        disk: &D,
        current: &LivenessSet,
        next: &mut LivenessSet,
        buffer: &mut [u8],
    ) -> Result<u64, Phase2Error>
    where
        D: Disk + ?Sized,
    {
        let mut streamer = self.streamer(buffer);
        let mut kept = 0;
        while let Some(chunk) = streamer.next_chunk(disk, buffer)? {
            for (index, entry) in chunk.entries(buffer) {
                if !current.get(index) {
                    continue;
                }
                let (pos, offset) = self.read_ref(entry);
                if pos + offset >= next.len() {
                    return Err(Phase2Error::DanglingReference {
                        table: self.table,
                        index,
                        pos,
                        offset,
                        size: next.len(),
                    });
                }
                next.set(pos);
                next.set(pos + offset);
                kept += 1;
            }
        }
        Ok(kept)
    }

    /// Second scan of table 7: remaps `pos` and `offset` and writes each
    /// chunk back where it was read from.
    fn rewrite_in_place<D>(
        &self,
        disk: &mut D,
        index: &RankIndex,
        buffer: &mut [u8],
    ) -> Result<(), Phase2Error>
    where
        D: Disk + ?Sized,
    {
        let k = self.k;
        let mut streamer = self.streamer(buffer);
        while let Some(chunk) = streamer.next_chunk(&*disk, buffer)? {
            for (_, entry) in chunk.entries_mut(buffer) {
                let f7 = slice_u64(entry, 0, k);
                let (pos, offset) = self.read_ref(entry);
                let (new_pos, new_offset) = index.lookup(pos, offset);
                EntryWriter::new(entry)
                    .append(f7, k)
                    .append(new_pos, k)
                    .append(new_offset, OFFSET_SIZE);
            }
            disk.write_at(chunk.file_offset, &buffer[..chunk.len])?;
        }
        Ok(())
    }

    /// Second scan of tables 2 to 6: drops the entries `current` doesn't
    /// keep, re-encodes the rest, sorts them by their new `pos` and writes
    /// them over the table, which is then truncated.  Returns the number of
    /// entries written.
    fn sort_by_pos<D>(
        &self,
        disk: &mut D,
        current: &LivenessSet,
        index: &RankIndex,
        buffer: &mut [u8],
        sort_cache: &mut [u8],
        config: &BackpropConfig,
    ) -> Result<u64, Phase2Error>
    where
        D: Disk + ?Sized,
    {
        let k = self.k;
        let entry_size = self.entry_size;
        let mut sort = SortManager::new(
            sort_cache,
            SortParams {
                num_buckets: config.num_buckets as usize,
                log_num_buckets: config.log_num_buckets,
                entry_size,
                begin_bits: k + 1,
                tmp_dir: config.tmp_dir.clone(),
                file_prefix: config.scratch_prefix(self.table),
            },
        )?;

        let sort_start = Instant::now();
        let mut new_entry = vec![0; entry_size];
        let mut sort_key = 0;
        let mut streamer = self.streamer(buffer);
        while let Some(chunk) = streamer.next_chunk(&*disk, buffer)? {
            for (entry_index, entry) in chunk.entries(buffer) {
                if !current.get(entry_index) {
                    continue;
                }
                let (pos, offset) = self.read_ref(entry);
                let (new_pos, new_offset) = index.lookup(pos, offset);
                EntryWriter::new(&mut new_entry)
                    .append(sort_key, k + 1)
                    .append(new_pos, k)
                    .append(new_offset, OFFSET_SIZE);
                sort.add_to_cache(&new_entry)?;
                sort_key += 1;
            }
        }
        sort.flush_cache()?;
        debug!(
            "sorted {sort_key} entries of table {} in {:.2?}",
            self.table,
            sort_start.elapsed()
        );

        // Both scans are done with the read buffer, so it batches the writes.
        let write_start = Instant::now();
        let total = sort_key * entry_size as u64;
        let mut position = 0;
        let mut filled = 0;
        while position < total {
            let entry = sort.read_entry(position)?;
            buffer[filled..filled + entry_size].copy_from_slice(entry);
            filled += entry_size;
            position += entry_size as u64;
            if filled + entry_size > buffer.len() || position == total {
                disk.write_at(position - filled as u64, &buffer[..filled])?;
                filled = 0;
            }
        }
        disk.truncate(total)?;
        debug!(
            "wrote table {} in {:.2?}",
            self.table,
            write_start.elapsed()
        );
        Ok(sort_key)
    }
}

/// Compacts table 1 down to the entries that `live` keeps, reading it in
/// chunks of `memory.len()` bytes.  Returns the number of entries kept.
fn compact_table<D>(
    disk: &mut D,
    size: u64,
    entry_size: usize,
    live: &LivenessSet,
    memory: &mut [u8],
) -> Result<u64, Phase2Error>
where
    D: Disk + ?Sized,
{
    let start = Instant::now();
    let mut streamer = TableStreamer::new(size, entry_size, memory.len());
    let mut write_cursor = 0;
    while let Some(chunk) = streamer.next_chunk(&*disk, memory)? {
        // Kept entries move to the front of the buffer.  While nothing has
        // been dropped, they are also already where they belong on disk.
        let in_place = write_cursor == chunk.file_offset;
        let mut kept = 0;
        let mut unmoved = 0;
        for i in 0..chunk.num_entries() {
            if !live.get(chunk.first_index + i as u64) {
                continue;
            }
            let from = i * entry_size;
            if from != kept {
                memory.copy_within(from..from + entry_size, kept);
            } else if in_place {
                unmoved = kept + entry_size;
            }
            kept += entry_size;
        }
        if unmoved < kept {
            disk.write_at(write_cursor + unmoved as u64, &memory[unmoved..kept])?;
        }
        write_cursor += kept as u64;
    }
    disk.truncate(write_cursor)?;
    debug!("compacted table 1 in {:.2?}", start.elapsed());
    Ok(write_cursor / entry_size as u64)
}

#[cfg(test)]
mod tests;
