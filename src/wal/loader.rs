//! Replaying WAL segments into a cache
//!
//! On startup the engine points the loader at its WAL segment files in
//! order. Each decoded record is applied through the cache's public write
//! interface, so replay observes the same admission and delete semantics as
//! live traffic. A segment that turns out to be corrupt mid-file is
//! truncated back to its last valid record, which keeps subsequent appends
//! by the WAL writer consistent.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::record::{WalEntry, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use super::{WalError, WalIoResultExt, WalResult};
use crate::cache::Cache;
use crate::error::Result;

/// Sequential reader over one WAL segment file
///
/// Tracks the byte offset just past the last record that framed, checksummed
/// and decoded successfully; that offset is where a corrupt segment gets
/// truncated.
pub struct WalSegmentReader {
    reader: BufReader<File>,
    good_offset: u64,
}

impl WalSegmentReader {
    /// Wrap a segment file opened for reading
    pub fn new(file: File) -> Self {
        Self {
            reader: BufReader::new(file),
            good_offset: 0,
        }
    }

    /// Offset just past the last fully valid record
    pub fn position(&self) -> u64 {
        self.good_offset
    }

    /// Recover the underlying file, for truncation
    pub fn into_inner(self) -> File {
        self.reader.into_inner()
    }

    /// Read the next record
    ///
    /// Returns `Ok(None)` at a clean end of file. Torn headers or payloads,
    /// checksum mismatches, and undecodable payloads are errors; the reader
    /// should not be advanced past them.
    pub fn read_entry(&mut self) -> WalResult<Option<WalEntry>> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = self
                .reader
                .read(&mut header[filled..])
                .with_context("reading record header")?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < HEADER_SIZE {
            return Err(WalError::Corruption {
                offset: self.good_offset,
                message: format!("torn record header ({} of {} bytes)", filled, HEADER_SIZE),
            });
        }

        let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = header[4];
        let expected = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WalError::Corruption {
                offset: self.good_offset,
                message: format!("record length {} exceeds maximum", payload_len),
            });
        }

        let mut payload = vec![0u8; payload_len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| WalError::Corruption {
                offset: self.good_offset,
                message: format!("torn record payload: {}", e),
            })?;

        let actual = WalEntry::compute_checksum(kind, &payload);
        if actual != expected {
            return Err(WalError::ChecksumMismatch {
                expected,
                actual,
                offset: self.good_offset,
            });
        }

        let entry =
            WalEntry::decode_payload(kind, &payload).map_err(|e| WalError::InvalidRecord {
                offset: self.good_offset,
                message: e.to_string(),
            })?;

        self.good_offset += (HEADER_SIZE + payload_len) as u64;
        Ok(Some(entry))
    }
}

/// Replays WAL segment files into a cache
///
/// Files are processed in the order supplied. See the module docs for the
/// corruption and error semantics.
pub struct CacheLoader {
    files: Vec<PathBuf>,
}

impl CacheLoader {
    /// Create a loader over an ordered list of segment files
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    /// Load every segment into the cache
    ///
    /// Corrupt tails are truncated in place and replay continues with the
    /// next segment; open and apply errors abort the load.
    pub async fn load(&self, cache: &Cache) -> Result<()> {
        for path in &self.files {
            self.load_segment(path, cache)?;
        }
        Ok(())
    }

    fn load_segment(&self, path: &Path, cache: &Cache) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(format!("opening segment {:?}", path))?;

        let size = file
            .metadata()
            .with_context(format!("reading metadata for {:?}", path))?
            .len();
        info!(file = %path.display(), size, "reading WAL segment");

        let mut reader = WalSegmentReader::new(file);
        let mut corrupt_at = None;

        loop {
            match reader.read_entry() {
                Ok(Some(WalEntry::Write(w))) => cache.write_multi(w.values)?,
                Ok(Some(WalEntry::Delete(d))) => cache.delete(&d.keys),
                Ok(Some(WalEntry::DeleteRange(d))) => cache.delete_range(&d.keys, d.min, d.max),
                Ok(None) => break,
                Err(e) => {
                    corrupt_at = Some(reader.position());
                    warn!(
                        file = %path.display(),
                        offset = reader.position(),
                        error = %e,
                        "WAL segment corrupt, truncating"
                    );
                    break;
                }
            }
        }

        if let Some(offset) = corrupt_at {
            let file = reader.into_inner();
            file.set_len(offset)
                .with_context(format!("truncating segment {:?}", path))?;
        }

        Ok(())
    }
}
