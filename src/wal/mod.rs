//! WAL segment replay
//!
//! The write-ahead log itself (segment rotation, fsync policy, retention) is
//! owned by the storage engine around this crate. What lives here is the
//! part the cache needs: the framed record format and a loader that replays
//! an ordered list of segment files into a cache at startup.
//!
//! # Record Format
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │    Length    │     Kind     │    CRC32     │   Payload    │
//! │   (4 bytes)  │   (1 byte)   │   (4 bytes)  │  (N bytes)   │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! - **Length**: payload length, not including the header
//! - **Kind**: record kind (write, delete, delete-range)
//! - **CRC32**: checksum of kind + payload
//! - **Payload**: the encoded record body
//!
//! # Recovery behavior
//!
//! Segments are replayed in the order given. A record that fails to frame,
//! checksum, or decode marks the rest of its segment as lost: the file is
//! truncated back to the end of the last valid record and replay continues
//! with the next segment. Errors opening a file or applying a record to the
//! cache abort the replay.

pub mod loader;
pub mod record;

pub use loader::{CacheLoader, WalSegmentReader};
pub use record::{DeleteRangeWalEntry, DeleteWalEntry, WalEntry, WriteWalEntry};

use std::io;

use thiserror::Error;

/// Result type for WAL operations
pub type WalResult<T> = std::result::Result<T, WalError>;

/// WAL error types
#[derive(Error, Debug)]
pub enum WalError {
    /// I/O error during WAL operations
    #[error("WAL I/O error ({context}): {source}")]
    Io {
        /// The underlying I/O error
        source: io::Error,
        /// What operation failed
        context: String,
    },

    /// A record could not be framed (torn header or payload)
    #[error("WAL corruption at offset {offset}: {message}")]
    Corruption {
        /// Byte offset of the end of the last valid record
        offset: u64,
        /// Description of the corruption
        message: String,
    },

    /// A record's checksum did not match its contents
    #[error("WAL checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the record header
        expected: u32,
        /// Checksum computed from the record contents
        actual: u32,
        /// Byte offset of the end of the last valid record
        offset: u64,
    },

    /// A record framed correctly but its payload did not decode
    #[error("invalid WAL record at offset {offset}: {message}")]
    InvalidRecord {
        /// Byte offset of the end of the last valid record
        offset: u64,
        /// Description of the decode failure
        message: String,
    },
}

/// Extension trait for adding context to I/O errors
pub trait WalIoResultExt<T> {
    /// Wrap an I/O error with a description of the failed operation
    fn with_context(self, context: impl Into<String>) -> WalResult<T>;
}

impl<T> WalIoResultExt<T> for std::result::Result<T, io::Error> {
    fn with_context(self, context: impl Into<String>) -> WalResult<T> {
        self.map_err(|e| WalError::Io {
            source: e,
            context: context.into(),
        })
    }
}
