//! Cache statistics
//!
//! Six counters and gauges tracked by every cache, all updated atomically.
//! Reads return a per-counter consistent snapshot; consistency across
//! counters is not guaranteed and not needed by consumers, which sample the
//! whole set periodically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

/// Measurement name the cache statistics are exported under
pub const CACHE_MEASUREMENT: &str = "tsm1_cache";

// Levels - point in time measures
const STAT_MEM_BYTES: &str = "memBytes";
const STAT_DISK_BYTES: &str = "diskBytes";
const STAT_SNAPSHOTS: &str = "snapshotCount";
const STAT_CACHE_AGE_MS: &str = "cacheAgeMs";

// Counters - accumulative measures
const STAT_CACHED_BYTES: &str = "cachedBytes";
const STAT_WAL_COMPACTION_TIME_MS: &str = "WALCompactionTimeMs";

/// One named statistic set with its tags and integer fields
///
/// The transport (HTTP endpoint, expvar, push gateway) is owned by the
/// caller; this type is just the snapshot it serializes.
#[derive(Debug, Clone, Serialize)]
pub struct Statistic {
    /// Measurement name
    pub name: String,
    /// Caller-supplied tags
    pub tags: HashMap<String, String>,
    /// Field name to current value
    pub values: HashMap<String, i64>,
}

/// Atomic counters and gauges tracked by a cache
#[derive(Debug, Default)]
pub struct CacheStatistics {
    /// Current live size in bytes (gauge)
    mem_bytes: AtomicI64,
    /// Current snapshot size in bytes (gauge)
    disk_bytes: AtomicI64,
    /// Pending snapshot attempts since the last successful clear (gauge)
    snapshot_count: AtomicI64,
    /// Milliseconds since the cache was last reset by a snapshot (gauge)
    cache_age_ms: AtomicI64,
    /// Total bytes ever moved into snapshots (counter)
    cached_bytes: AtomicI64,
    /// Total milliseconds spent compacting snapshots downstream (counter)
    wal_compaction_time_ms: AtomicI64,
}

impl CacheStatistics {
    /// Add `delta` (possibly negative) to the live-size gauge
    pub fn add_mem_bytes(&self, delta: i64) {
        self.mem_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    /// Add to the cumulative snapshotted-bytes counter
    pub fn add_cached_bytes(&self, delta: i64) {
        self.cached_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    /// Add to the cumulative downstream compaction time counter
    pub fn add_compaction_time_ms(&self, delta: i64) {
        self.wal_compaction_time_ms.fetch_add(delta, Ordering::Relaxed);
    }

    /// Set the snapshot-size and pending-attempt gauges
    pub fn set_snapshot_gauges(&self, disk_bytes: i64, attempts: i64) {
        self.disk_bytes.store(disk_bytes, Ordering::Relaxed);
        self.snapshot_count.store(attempts, Ordering::Relaxed);
    }

    /// Set the cache-age gauge
    pub fn set_cache_age_ms(&self, age_ms: i64) {
        self.cache_age_ms.store(age_ms, Ordering::Relaxed);
    }

    /// Current value of the live-size gauge
    pub fn mem_bytes(&self) -> i64 {
        self.mem_bytes.load(Ordering::Relaxed)
    }

    /// Current value of the snapshot-size gauge
    pub fn disk_bytes(&self) -> i64 {
        self.disk_bytes.load(Ordering::Relaxed)
    }

    /// Snapshot all fields under their export names
    pub fn values(&self) -> HashMap<String, i64> {
        let mut values = HashMap::with_capacity(6);
        values.insert(STAT_MEM_BYTES.to_string(), self.mem_bytes.load(Ordering::Relaxed));
        values.insert(STAT_DISK_BYTES.to_string(), self.disk_bytes.load(Ordering::Relaxed));
        values.insert(
            STAT_SNAPSHOTS.to_string(),
            self.snapshot_count.load(Ordering::Relaxed),
        );
        values.insert(
            STAT_CACHE_AGE_MS.to_string(),
            self.cache_age_ms.load(Ordering::Relaxed),
        );
        values.insert(
            STAT_CACHED_BYTES.to_string(),
            self.cached_bytes.load(Ordering::Relaxed),
        );
        values.insert(
            STAT_WAL_COMPACTION_TIME_MS.to_string(),
            self.wal_compaction_time_ms.load(Ordering::Relaxed),
        );
        values
    }
}
