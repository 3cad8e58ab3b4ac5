//! [Disk] implementation using POSIX I/O.

use ::metrics::{counter, histogram};
use std::{
    fs::{remove_file, File, OpenOptions},
    io::ErrorKind,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::warn;

use crate::metrics::{
    FILES_CREATED, FILES_DELETED, READS_FAILED, READS_SUCCESS, READ_LATENCY, TOTAL_BYTES_READ,
    TOTAL_BYTES_WRITTEN, TRUNCATES, WRITES_FAILED, WRITES_SUCCESS, WRITE_LATENCY,
};
use crate::{init, Disk, StorageError};

/// Removes a scratch file when dropped, unless told to keep it.
struct DeleteOnDrop {
    path: PathBuf,
    keep: bool,
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = remove_file(&self.path) {
                warn!("Unable to delete file {:?}: {:?}", self.path, e);
            } else {
                counter!(FILES_DELETED).increment(1);
            }
        }
    }
}

/// A table or scratch file on a POSIX filesystem.
///
/// Files opened with [`FileDisk::open`] belong to the caller and are never
/// deleted.  Files created with [`FileDisk::create_scratch`] are deleted
/// when the `FileDisk` is dropped.
pub struct FileDisk {
    file: File,
    drop: DeleteOnDrop,
}

impl FileDisk {
    /// Opens the existing file at `path` for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        init();
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            file,
            drop: DeleteOnDrop { path, keep: true },
        })
    }

    /// Creates a new, empty scratch file at `path`.  The file must not
    /// already exist.  It is removed when the returned value is dropped.
    pub fn create_scratch<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        init();
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(StorageError::StorageLocationNotFound(parent.to_path_buf()));
            }
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        counter!(FILES_CREATED).increment(1);
        Ok(Self {
            file,
            drop: DeleteOnDrop { path, keep: false },
        })
    }

    /// Returns the path of the file.
    pub fn path(&self) -> &Path {
        &self.drop.path
    }

    /// Keeps a scratch file on disk after this value is dropped.
    pub fn keep(&mut self) {
        self.drop.keep = true;
    }
}

impl Disk for FileDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let request_start = Instant::now();
        match self.file.read_exact_at(buf, offset) {
            Ok(()) => {
                counter!(TOTAL_BYTES_READ).increment(buf.len() as u64);
                counter!(READS_SUCCESS).increment(1);
                histogram!(READ_LATENCY).record(request_start.elapsed().as_secs_f64());
                Ok(())
            }
            Err(e) => {
                counter!(READS_FAILED).increment(1);
                if e.kind() == ErrorKind::UnexpectedEof {
                    Err(StorageError::ShortRead {
                        offset,
                        length: buf.len(),
                        size: self.size()?,
                    })
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let request_start = Instant::now();
        match self.file.write_all_at(data, offset) {
            Ok(()) => {
                counter!(TOTAL_BYTES_WRITTEN).increment(data.len() as u64);
                counter!(WRITES_SUCCESS).increment(1);
                histogram!(WRITE_LATENCY).record(request_start.elapsed().as_secs_f64());
                Ok(())
            }
            Err(e) => {
                counter!(WRITES_FAILED).increment(1);
                Err(e.into())
            }
        }
    }

    fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        self.file.set_len(len)?;
        counter!(TRUNCATES).increment(1);
        Ok(())
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }

    fn name(&self) -> String {
        self.drop.path.display().to_string()
    }
}
