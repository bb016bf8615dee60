//! Error types for the write cache

use thiserror::Error;

use crate::values::FieldTypeError;
use crate::wal::WalError;

/// Main error type for the write cache
#[derive(Error, Debug)]
pub enum Error {
    /// Admitting the write would push the cache past its byte budget
    #[error("cache maximum memory size exceeded")]
    CacheMemoryExceeded,

    /// A checkpoint marker did not match the cache's state
    #[error("invalid checkpoint")]
    InvalidCheckpoint,

    /// A snapshot is already in progress
    #[error("snapshot in progress")]
    SnapshotInProgress,

    /// A series holds values of more than one payload type
    #[error(transparent)]
    FieldType(#[from] FieldTypeError),

    /// WAL error
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
