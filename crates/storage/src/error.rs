use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// An error that can occur when accessing a table or scratch file.
#[derive(Clone, Error, Debug, Serialize, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error.
    #[error("{0}")]
    #[serde(serialize_with = "serialize_io_error")]
    StdIo(ErrorKind),

    /// Read ended before the full request length.
    #[error("Reading {length} bytes at offset {offset} would run past the end of the file ({size} bytes).")]
    ShortRead { offset: u64, length: usize, size: u64 },

    /// The directory that should hold scratch files does not exist.
    #[error("The scratch directory {} does not exist.", .0.display())]
    StorageLocationNotFound(PathBuf),

    /// A file name that can't be used inside a scratch directory.
    ///
    /// Scratch file names may not contain path separators or be empty.
    #[error("Name is not valid for a scratch file: {0:?}")]
    InvalidName(String),
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        Self::StdIo(value.kind())
    }
}

fn serialize_io_error<S>(kind: &ErrorKind, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut ser = serializer.serialize_struct("IOError", 1)?;
    ser.serialize_field("kind", &kind.to_string())?;
    ser.end()
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::StdIo(kind) => *kind,
            StorageError::ShortRead { .. } => ErrorKind::UnexpectedEof,
            StorageError::StorageLocationNotFound(_) => ErrorKind::NotFound,
            StorageError::InvalidName(_) => ErrorKind::InvalidInput,
        }
    }

    pub fn ignore_notfound<T>(result: Result<T, Self>) -> Result<(), Self> {
        match result {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }
}
