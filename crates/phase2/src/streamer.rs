//! Chunked sequential reads of a table.

use plotkit_storage::{error::StorageError, Disk};

/// Reads the entries of one table in file order, as many whole entries at a
/// time as fit in a caller-provided buffer.
///
/// Every entry is numbered with its position in the file.  Two streamers
/// built with the same arguments visit the same entries in the same chunks
/// with the same numbers, which is what lets a second pass over a table
/// repeat the decisions of the first.
#[derive(Debug)]
pub struct TableStreamer {
    entry_size: usize,
    table_bytes: u64,
    chunk_bytes: usize,
    read_cursor: u64,
    read_index: u64,
}

/// A run of consecutive entries that [`TableStreamer::next_chunk`] placed at
/// the start of the buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Index in the table of the chunk's first entry.
    pub first_index: u64,
    /// Byte offset in the file of the chunk's first entry.
    pub file_offset: u64,
    /// Number of bytes read into the buffer.
    pub len: usize,
    entry_size: usize,
}

impl Chunk {
    /// Number of entries in the chunk.
    pub fn num_entries(&self) -> usize {
        self.len / self.entry_size
    }

    /// Iterates over the chunk's entries in `buffer` with their table
    /// indexes.
    pub fn entries<'b>(&self, buffer: &'b [u8]) -> impl Iterator<Item = (u64, &'b [u8])> {
        let first_index = self.first_index;
        buffer[..self.len]
            .chunks_exact(self.entry_size)
            .enumerate()
            .map(move |(i, entry)| (first_index + i as u64, entry))
    }

    /// Like [`entries`](Self::entries), but allows rewriting entries in
    /// place.
    pub fn entries_mut<'b>(
        &self,
        buffer: &'b mut [u8],
    ) -> impl Iterator<Item = (u64, &'b mut [u8])> {
        let first_index = self.first_index;
        buffer[..self.len]
            .chunks_exact_mut(self.entry_size)
            .enumerate()
            .map(move |(i, entry)| (first_index + i as u64, entry))
    }
}

impl TableStreamer {
    /// Prepares to read `table_size` entries of `entry_size` bytes through a
    /// buffer of `buffer_len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the buffer can't hold a single entry.
    pub fn new(table_size: u64, entry_size: usize, buffer_len: usize) -> Self {
        assert!(entry_size > 0);
        assert!(
            buffer_len >= entry_size,
            "a {buffer_len}-byte buffer can't hold a {entry_size}-byte entry"
        );
        Self {
            entry_size,
            table_bytes: table_size * entry_size as u64,
            chunk_bytes: buffer_len - buffer_len % entry_size,
            read_cursor: 0,
            read_index: 0,
        }
    }

    /// Bytes read per full chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Reads the next chunk of entries from `disk` into the start of
    /// `buffer`, or returns `None` once the whole table has been read.
    pub fn next_chunk<D>(
        &mut self,
        disk: &D,
        buffer: &mut [u8],
    ) -> Result<Option<Chunk>, StorageError>
    where
        D: Disk + ?Sized,
    {
        if self.read_cursor >= self.table_bytes {
            return Ok(None);
        }
        let len = (self.chunk_bytes as u64).min(self.table_bytes - self.read_cursor) as usize;
        disk.read_at(self.read_cursor, &mut buffer[..len])?;

        let chunk = Chunk {
            first_index: self.read_index,
            file_offset: self.read_cursor,
            len,
            entry_size: self.entry_size,
        };
        self.read_cursor += len as u64;
        self.read_index += (len / self.entry_size) as u64;
        Ok(Some(chunk))
    }
}
