//! Sumu TSDB - in-memory write cache for a TSM-style storage engine
//!
//! This library provides the hot write path of a time-series storage engine:
//! - Memory-bounded buffering of recently written points, keyed by series
//! - Lazy per-series deduplication and sorting of out-of-order batches
//! - Non-blocking snapshot handoff to a downstream compactor
//! - Refcounted series-key interning shared between live and snapshot caches
//! - WAL segment replay with corruption truncation on startup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod stats;
pub mod types;
pub mod values;
pub mod wal;

// Re-export main types
pub use cache::{Cache, CacheConfig};
pub use error::{Error, Result};
pub use types::{FieldValue, SeriesId, Value, ValueType};
pub use values::ValuesExt;
pub use wal::CacheLoader;
