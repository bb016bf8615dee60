//! In-memory write cache with snapshot handoff
//!
//! The cache buffers recently written values per series, enforces a byte
//! budget, and hands its contents to a downstream compactor through an
//! immutable sibling cache that stays queryable while the compactor works.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Cache (live)                      │
//! │  entries:        SeriesId -> Entry                       │
//! │  intern_forward: OwnedKey -> SeriesId                    │
//! │  intern_reverse: SeriesId -> OwnedKey                    │
//! │  size / max_size / snapshot bookkeeping                  │
//! ├──────────────────────────────────────────────────────────┤
//! │                     Cache (snapshot)                     │
//! │  read-only sibling populated by snapshot(), queried      │
//! │  together with the live cache until clear_snapshot()     │
//! └──────────────────────────────────────────────────────────┘
//!                     │ shared
//!                     v
//!              KeyArena (refcounted canonical key bytes)
//! ```
//!
//! Snapshotting moves entry handles instead of copying values: the live
//! cache's maps are rebuilt empty, the sibling takes ownership of the
//! entries, and the arena keeps the shared key bytes alive across the
//! transfer.
//!
//! # Example
//!
//! ```rust
//! use sumu_tsdb::{Cache, Value};
//!
//! let cache = Cache::new(0);
//! cache.write(b"cpu,host=a", vec![Value::float(2, 0.2), Value::float(1, 0.1)]).unwrap();
//!
//! let values = cache.values(b"cpu,host=a");
//! assert_eq!(values[0].timestamp, 1);
//! ```

pub mod arena;
mod entry;
mod pool;

pub use arena::{KeyArena, OwnedKey};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::stats::{CacheStatistics, Statistic, CACHE_MEASUREMENT};
use crate::types::{SeriesId, Timestamp, Value, ValueType};
use crate::values::{FieldTypeError, ValuesExt};
use entry::Entry;
use pool::ENTRY_POOL;

/// Cache construction options
///
/// `max_size` of zero means unbounded. `initial_series_capacity` pre-sizes
/// the internal maps for workloads with known cardinality.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Byte budget shared by the live cache and its pending snapshot (0 = unbounded)
    pub max_size: u64,
    /// Initial capacity of the series maps
    pub initial_series_capacity: usize,
}

impl CacheConfig {
    /// Set the byte budget
    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the initial series map capacity
    pub fn initial_series_capacity(mut self, capacity: usize) -> Self {
        self.initial_series_capacity = capacity;
        self
    }
}

/// Everything guarded by the cache's reader/writer lock
#[derive(Debug)]
struct CacheState {
    /// Entry per interned series
    entries: HashMap<SeriesId, Arc<Entry>>,
    /// Interned key to cache-local series id
    intern_forward: HashMap<OwnedKey, SeriesId>,
    /// Cache-local series id back to interned key
    intern_reverse: HashMap<SeriesId, OwnedKey>,
    /// Byte footprint of all live entries
    size: u64,
    /// Byte budget (0 = unbounded)
    max_size: u64,
    /// Sibling cache currently being flushed, if any
    snapshot: Option<Arc<Cache>>,
    /// Bytes held by the sibling
    snapshot_size: u64,
    /// Guard against overlapping snapshots
    snapshotting: bool,
    /// Snapshot starts since the last successful clear
    snapshot_attempts: u64,
    /// When the live cache was last reset by a snapshot
    last_snapshot: Instant,
    /// Source of cache-local series ids
    series_sequence: u64,
}

impl CacheState {
    fn with_capacity(max_size: u64, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            intern_forward: HashMap::with_capacity(capacity),
            intern_reverse: HashMap::with_capacity(capacity),
            size: 0,
            max_size,
            snapshot: None,
            snapshot_size: 0,
            snapshotting: false,
            snapshot_attempts: 0,
            last_snapshot: Instant::now(),
            series_sequence: 0,
        }
    }

    fn next_series_id(&mut self) -> SeriesId {
        self.series_sequence += 1;
        self.series_sequence
    }
}

/// In-memory store of values for a set of series keys
///
/// Thread-safe: one reader/writer lock guards the series maps and size
/// accounting, each entry carries its own lock for appends, and the key
/// arena serializes interning. See the module docs for the snapshot
/// lifecycle.
#[derive(Debug)]
pub struct Cache {
    state: RwLock<CacheState>,
    arena: Arc<KeyArena>,
    stats: CacheStatistics,
}

impl Cache {
    /// Create a cache with the given byte budget, backed by the global arena
    ///
    /// A `max_size` of zero disables the budget.
    pub fn new(max_size: u64) -> Self {
        Self::with_arena(max_size, KeyArena::global())
    }

    /// Create a cache backed by an explicit key arena
    ///
    /// Caches that snapshot into each other must share one arena. Separate
    /// arenas are useful for tests and multi-tenant isolation.
    pub fn with_arena(max_size: u64, arena: Arc<KeyArena>) -> Self {
        Self::with_config(CacheConfig::default().max_size(max_size), arena)
    }

    /// Create a cache from a full configuration
    pub fn with_config(config: CacheConfig, arena: Arc<KeyArena>) -> Self {
        let cache = Self {
            state: RwLock::new(CacheState::with_capacity(
                config.max_size,
                config.initial_series_capacity,
            )),
            arena,
            stats: CacheStatistics::default(),
        };
        cache.update_age();
        cache.stats.set_snapshot_gauges(0, 0);
        cache
    }

    /// An empty sibling for snapshot handoff, sharing this cache's arena
    fn sibling(arena: Arc<KeyArena>) -> Self {
        Self {
            state: RwLock::new(CacheState::with_capacity(0, 0)),
            arena,
            stats: CacheStatistics::default(),
        }
    }

    /// Write a batch of values for one series key
    ///
    /// Returns [`Error::CacheMemoryExceeded`] without changing any state if
    /// admitting the batch would push the live size plus the pending
    /// snapshot size past the budget.
    pub fn write(&self, key: &[u8], values: Vec<Value>) -> Result<()> {
        let added = values.byte_size() as u64;

        let mut state = self.state.write();
        let new_size = state.size + added;
        if state.max_size > 0 && new_size + state.snapshot_size > state.max_size {
            return Err(Error::CacheMemoryExceeded);
        }

        self.write_locked(&mut state, key, values);
        state.size = new_size;
        drop(state);

        self.stats.add_mem_bytes(added as i64);
        Ok(())
    }

    /// Write batches for several series keys
    ///
    /// Admission is checked once against the aggregate size. The check runs
    /// under the shared lock and the appends run under per-entry locks, so
    /// two concurrent calls can both pass admission and overshoot the budget
    /// transiently; the size increment itself is atomic across the batch.
    pub fn write_multi(&self, batches: HashMap<Vec<u8>, Vec<Value>>) -> Result<()> {
        let total: u64 = batches.values().map(|v| v.byte_size() as u64).sum();

        {
            let state = self.state.read();
            if state.max_size > 0 && state.size + total + state.snapshot_size > state.max_size {
                return Err(Error::CacheMemoryExceeded);
            }
        }

        for (key, values) in batches {
            self.entry(&key).add(values);
        }

        self.state.write().size += total;
        self.stats.add_mem_bytes(total as i64);
        Ok(())
    }

    /// Hand the live contents to a sibling cache for compaction
    ///
    /// The live cache is reset; the returned sibling stays queryable through
    /// [`Cache::values`] until [`Cache::clear_snapshot`] ends the handoff.
    /// Fails with [`Error::SnapshotInProgress`] if a handoff is already
    /// running. After a failed handoff the same sibling is reused and the
    /// values written since are folded into it.
    pub fn snapshot(&self) -> Result<Arc<Cache>> {
        let mut state = self.state.write();

        if state.snapshotting {
            return Err(Error::SnapshotInProgress);
        }
        state.snapshotting = true;
        state.snapshot_attempts += 1;

        let sibling = match &state.snapshot {
            Some(existing) => Arc::clone(existing),
            None => {
                let fresh = Arc::new(Cache::sibling(Arc::clone(&self.arena)));
                state.snapshot = Some(Arc::clone(&fresh));
                fresh
            }
        };

        let entries = std::mem::take(&mut state.entries);
        let forward = std::mem::take(&mut state.intern_forward);
        let reverse = std::mem::take(&mut state.intern_reverse);

        {
            let mut sib = sibling.state.write();
            for (series_id, entry) in entries {
                let key = match reverse.get(&series_id) {
                    Some(key) => key,
                    None => continue,
                };
                let moved = entry.size() as u64;

                match sib.intern_forward.get(key.as_bytes()).copied() {
                    Some(existing_id) => {
                        // A prior handoff failed; fold the values written
                        // since then into the entry the sibling already holds.
                        if let Some(dst) = sib.entries.get(&existing_id).map(Arc::clone) {
                            entry.with_values(|vals| dst.extend_from(vals));
                            if entry.needs_sort() {
                                dst.mark_unsorted();
                            }
                        }
                    }
                    None => {
                        self.arena.inc(key, 1);
                        let sibling_id = sib.next_series_id();
                        sib.intern_forward.insert(key.clone(), sibling_id);
                        sib.intern_reverse.insert(sibling_id, key.clone());
                        sib.entries.insert(sibling_id, entry);
                    }
                }

                state.snapshot_size += moved;
                sib.size += moved;
            }
        }

        // The sibling holds its own reference on every key now; release the
        // live cache's.
        let series = forward.len();
        for key in forward.keys() {
            self.arena.dec(key, 1);
        }

        state.entries = HashMap::with_capacity(series);
        state.intern_forward = HashMap::with_capacity(series);
        state.intern_reverse = HashMap::with_capacity(series);

        let moved_bytes = state.size;
        state.size = 0;
        state.last_snapshot = Instant::now();

        self.stats.add_mem_bytes(-(moved_bytes as i64));
        self.stats.add_cached_bytes(moved_bytes as i64);
        self.stats
            .set_snapshot_gauges(state.snapshot_size as i64, state.snapshot_attempts as i64);

        debug!(
            bytes = moved_bytes,
            attempts = state.snapshot_attempts,
            "cache snapshot started"
        );

        Ok(sibling)
    }

    /// End the current snapshot handoff
    ///
    /// On success the sibling is dropped and its key references are returned
    /// to the arena. On failure the sibling is kept so a later
    /// [`Cache::snapshot`] can retry with the accumulated data.
    pub fn clear_snapshot(&self, success: bool) {
        let mut state = self.state.write();
        state.snapshotting = false;

        if !success {
            return;
        }

        state.snapshot_attempts = 0;
        state.snapshot_size = 0;

        if let Some(old) = state.snapshot.take() {
            let old_state = old.state.read();
            for key in old_state.intern_forward.keys() {
                self.arena.dec(key, 1);
            }
            debug!(series = old_state.entries.len(), "cache snapshot cleared");
        }

        self.stats.set_snapshot_gauges(0, 0);
    }

    /// Sort and deduplicate every entry
    ///
    /// The compactor calls this on a snapshot before iterating it; queries
    /// arriving concurrently see either order, both valid.
    pub fn deduplicate(&self) {
        let state = self.state.read();
        for entry in state.entries.values() {
            entry.deduplicate();
        }
    }

    /// All values for a key, deduplicated and sorted
    ///
    /// Merges the pending snapshot's data (if any) with the live data. The
    /// caller owns the returned copy.
    pub fn values(&self, key: &[u8]) -> Vec<Value> {
        let state = self.state.read();
        self.merged(&state, key)
    }

    /// Sorted list of all series keys, as fresh heap copies
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let state = self.state.read();
        let mut keys: Vec<Vec<u8>> = state
            .intern_forward
            .keys()
            .map(|key| key.as_bytes().to_vec())
            .collect();
        keys.sort();
        keys
    }

    /// All series keys paired with their inferred payload type
    ///
    /// The type slot holds the conflict error for series that mix payload
    /// types. Order matches between the two lists but is otherwise
    /// unspecified.
    pub fn keys_and_types(
        &self,
    ) -> (
        Vec<Vec<u8>>,
        Vec<std::result::Result<ValueType, FieldTypeError>>,
    ) {
        let state = self.state.read();
        let mut keys = Vec::with_capacity(state.entries.len());
        let mut types = Vec::with_capacity(state.entries.len());
        for (series_id, entry) in &state.entries {
            if let Some(key) = state.intern_reverse.get(series_id) {
                keys.push(key.as_bytes().to_vec());
                types.push(entry.value_type());
            }
        }
        (keys, types)
    }

    /// Remove the given keys entirely
    pub fn delete<K: AsRef<[u8]>>(&self, keys: &[K]) {
        self.delete_range(keys, i64::MIN, i64::MAX);
    }

    /// Remove values with timestamps in `min..=max` for the given keys
    ///
    /// Keys not present are skipped. A series whose entry becomes empty is
    /// removed and its key reference returned to the arena.
    pub fn delete_range<K: AsRef<[u8]>>(&self, keys: &[K], min: Timestamp, max: Timestamp) {
        let mut state = self.state.write();
        let mut freed: u64 = 0;

        for key in keys {
            let key = key.as_ref();
            let series_id = match state.intern_forward.get(key) {
                Some(&id) => id,
                None => continue,
            };
            let entry = match state.entries.get(&series_id) {
                Some(entry) => Arc::clone(entry),
                None => continue,
            };
            let original = entry.size() as u64;

            if min == i64::MIN && max == i64::MAX {
                Self::remove_series(&self.arena, &mut state, series_id);
                state.size = state.size.saturating_sub(original);
                freed += original;
                continue;
            }

            entry.filter(min, max);
            if entry.count() == 0 {
                Self::remove_series(&self.arena, &mut state, series_id);
                state.size = state.size.saturating_sub(original);
                freed += original;
            } else {
                let shrunk = original.saturating_sub(entry.size() as u64);
                state.size = state.size.saturating_sub(shrunk);
                freed += shrunk;
            }
        }
        drop(state);

        if freed > 0 {
            self.stats.add_mem_bytes(-(freed as i64));
        }
    }

    /// Current byte footprint of the live entries
    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    /// Current byte budget (0 = unbounded)
    pub fn max_size(&self) -> u64 {
        self.state.read().max_size
    }

    /// Replace the byte budget
    pub fn set_max_size(&self, max_size: u64) {
        self.state.write().max_size = max_size;
    }

    /// Statistics snapshot for periodic monitoring
    pub fn statistics(&self, tags: HashMap<String, String>) -> Vec<Statistic> {
        vec![Statistic {
            name: CACHE_MEASUREMENT.to_string(),
            tags,
            values: self.stats.values(),
        }]
    }

    /// Refresh the cache-age gauge from the last snapshot reset
    pub fn update_age(&self) {
        let age = self.state.read().last_snapshot.elapsed().as_millis() as i64;
        self.stats.set_cache_age_ms(age);
    }

    /// Accumulate time the downstream compactor spent on snapshot data
    pub fn update_compact_time(&self, duration: Duration) {
        self.stats.add_compaction_time_ms(duration.as_millis() as i64);
    }

    /// Append under an already-held exclusive lock, interning the key if new
    fn write_locked(&self, state: &mut CacheState, key: &[u8], values: Vec<Value>) {
        match state.intern_forward.get(key).copied() {
            Some(series_id) => {
                if let Some(entry) = state.entries.get(&series_id) {
                    entry.add(values);
                }
            }
            None => {
                let owned = self.arena.get_owned(key);
                let series_id = state.next_series_id();
                let entry = ENTRY_POOL.acquire();
                entry.add(values);
                state.entries.insert(series_id, entry);
                state.intern_forward.insert(owned.clone(), series_id);
                state.intern_reverse.insert(series_id, owned);
            }
        }
    }

    /// Entry for a key, created if absent
    ///
    /// Double-checked: the common case returns under the shared lock;
    /// creation re-checks under the exclusive lock before inserting.
    fn entry(&self, key: &[u8]) -> Arc<Entry> {
        {
            let state = self.state.read();
            if let Some(&series_id) = state.intern_forward.get(key) {
                if let Some(entry) = state.entries.get(&series_id) {
                    return Arc::clone(entry);
                }
            }
        }

        let mut state = self.state.write();
        if let Some(&series_id) = state.intern_forward.get(key) {
            if let Some(entry) = state.entries.get(&series_id) {
                return Arc::clone(entry);
            }
        }

        let owned = self.arena.get_owned(key);
        let series_id = state.next_series_id();
        let entry = ENTRY_POOL.acquire();
        state.entries.insert(series_id, Arc::clone(&entry));
        state.intern_forward.insert(owned.clone(), series_id);
        state.intern_reverse.insert(series_id, owned);
        entry
    }

    /// Merge snapshot and live values for a key into one sorted copy
    fn merged(&self, state: &CacheState, key: &[u8]) -> Vec<Value> {
        let live = state
            .intern_forward
            .get(key)
            .and_then(|series_id| state.entries.get(series_id))
            .map(Arc::clone);

        if live.is_none() && state.snapshot.is_none() {
            return Vec::new();
        }

        let mut sources: Vec<Arc<Entry>> = Vec::with_capacity(2);
        if let Some(snap) = &state.snapshot {
            let snap_state = snap.state.read();
            if let Some(entry) = snap_state
                .intern_forward
                .get(key)
                .and_then(|series_id| snap_state.entries.get(series_id))
            {
                sources.push(Arc::clone(entry));
            }
        }
        if let Some(entry) = live {
            sources.push(entry);
        }

        let mut total = 0;
        for entry in &sources {
            entry.deduplicate();
            total += entry.count();
        }
        if total == 0 {
            return Vec::new();
        }

        // Each source is sorted now; the combined buffer only needs another
        // pass when the boundary between them is non-monotonic.
        let mut merged: Vec<Value> = Vec::with_capacity(total);
        let mut unsorted = false;
        for entry in &sources {
            entry.with_values(|vals| {
                if !unsorted {
                    if let (Some(last), Some(first)) = (merged.last(), vals.first()) {
                        unsorted = last.timestamp >= first.timestamp;
                    }
                }
                merged.extend_from_slice(vals);
            });
        }

        if unsorted {
            merged.deduplicate()
        } else {
            merged
        }
    }

    fn remove_series(arena: &KeyArena, state: &mut CacheState, series_id: SeriesId) {
        state.entries.remove(&series_id);
        if let Some(key) = state.intern_reverse.remove(&series_id) {
            state.intern_forward.remove(key.as_bytes());
            arena.dec(&key, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(points: &[(i64, f64)]) -> Vec<Value> {
        points.iter().map(|&(ts, v)| Value::float(ts, v)).collect()
    }

    fn private_cache(max_size: u64) -> (Cache, Arc<KeyArena>) {
        let arena = Arc::new(KeyArena::new());
        (Cache::with_arena(max_size, Arc::clone(&arena)), arena)
    }

    #[test]
    fn test_write_and_read_back() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1), (2, 0.2)])).unwrap();

        let values = cache.values(b"cpu");
        assert_eq!(values.len(), 2);
        assert_eq!(cache.size(), 32);
    }

    #[test]
    fn test_values_missing_key() {
        let (cache, _arena) = private_cache(0);
        assert!(cache.values(b"nope").is_empty());
    }

    #[test]
    fn test_out_of_order_write_reads_sorted() {
        let (cache, _arena) = private_cache(0);
        cache
            .write(b"cpu", floats(&[(3, 0.3), (1, 0.1), (2, 0.2), (1, 0.9)]))
            .unwrap();

        let values = cache.values(b"cpu");
        assert_eq!(
            values,
            vec![
                Value::float(1, 0.9),
                Value::float(2, 0.2),
                Value::float(3, 0.3)
            ]
        );
    }

    #[test]
    fn test_admission_rejects_over_budget() {
        let (cache, _arena) = private_cache(48);
        cache.write(b"cpu", floats(&[(1, 0.1), (2, 0.2)])).unwrap();
        assert_eq!(cache.size(), 32);

        let err = cache
            .write(b"cpu", floats(&[(3, 0.3), (4, 0.4)]))
            .unwrap_err();
        assert!(matches!(err, Error::CacheMemoryExceeded));
        assert_eq!(cache.size(), 32);

        // A batch that fits is still admitted
        cache.write(b"cpu", floats(&[(3, 0.3)])).unwrap();
        assert_eq!(cache.size(), 48);
    }

    #[test]
    fn test_zero_max_size_is_unbounded() {
        let (cache, _arena) = private_cache(0);
        for i in 0..1000 {
            cache.write(b"cpu", floats(&[(i, 0.1)])).unwrap();
        }
        assert_eq!(cache.size(), 16_000);
    }

    #[test]
    fn test_write_multi() {
        let (cache, _arena) = private_cache(0);
        let mut batches = HashMap::new();
        batches.insert(b"cpu".to_vec(), floats(&[(1, 0.1)]));
        batches.insert(b"mem".to_vec(), floats(&[(1, 0.5), (2, 0.6)]));
        cache.write_multi(batches).unwrap();

        assert_eq!(cache.size(), 48);
        assert_eq!(cache.values(b"cpu").len(), 1);
        assert_eq!(cache.values(b"mem").len(), 2);
    }

    #[test]
    fn test_write_multi_admission_is_aggregate() {
        let (cache, _arena) = private_cache(32);
        let mut batches = HashMap::new();
        batches.insert(b"cpu".to_vec(), floats(&[(1, 0.1), (2, 0.2)]));
        batches.insert(b"mem".to_vec(), floats(&[(1, 0.5)]));

        let err = cache.write_multi(batches).unwrap_err();
        assert!(matches!(err, Error::CacheMemoryExceeded));
        assert_eq!(cache.size(), 0);
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_keys_sorted_fresh_copies() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"mem", floats(&[(1, 0.5)])).unwrap();
        cache.write(b"cpu", floats(&[(1, 0.1)])).unwrap();
        cache.write(b"disk", floats(&[(1, 0.9)])).unwrap();

        assert_eq!(
            cache.keys(),
            vec![b"cpu".to_vec(), b"disk".to_vec(), b"mem".to_vec()]
        );
    }

    #[test]
    fn test_keys_and_types() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1)])).unwrap();
        cache
            .write(b"events", vec![Value::integer(1, 7), Value::string(2, "x")])
            .unwrap();

        let (keys, types) = cache.keys_and_types();
        assert_eq!(keys.len(), 2);
        for (key, inferred) in keys.iter().zip(types.iter()) {
            match key.as_slice() {
                b"cpu" => assert_eq!(inferred, &Ok(ValueType::Float)),
                b"events" => assert!(matches!(inferred, Err(FieldTypeError::Conflict { .. }))),
                other => panic!("unexpected key {:?}", other),
            }
        }
    }

    #[test]
    fn test_delete_removes_series_and_key_reference() {
        let (cache, arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1)])).unwrap();
        assert_eq!(arena.refcount(b"cpu"), Some(1));

        cache.delete(&[b"cpu"]);
        assert!(cache.keys().is_empty());
        assert_eq!(cache.size(), 0);
        assert_eq!(arena.refcount(b"cpu"), None);
    }

    #[test]
    fn test_delete_range_partial() {
        let (cache, _arena) = private_cache(0);
        cache
            .write(b"cpu", floats(&[(1, 0.1), (5, 0.5), (10, 1.0)]))
            .unwrap();
        let before = cache.size();

        cache.delete_range(&[b"cpu"], 4, 8);

        let values = cache.values(b"cpu");
        let ts: Vec<i64> = values.iter().map(|v| v.timestamp).collect();
        assert_eq!(ts, vec![1, 10]);
        assert_eq!(before - cache.size(), 16);
    }

    #[test]
    fn test_delete_range_emptying_drops_series() {
        let (cache, arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(5, 0.5)])).unwrap();

        cache.delete_range(&[b"cpu"], 1, 10);
        assert!(cache.keys().is_empty());
        assert_eq!(cache.size(), 0);
        assert_eq!(arena.refcount(b"cpu"), None);
    }

    #[test]
    fn test_delete_missing_key_is_noop() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1)])).unwrap();
        cache.delete(&[b"mem"]);
        assert_eq!(cache.size(), 16);
    }

    #[test]
    fn test_snapshot_moves_data() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1), (2, 0.2)])).unwrap();
        cache.write(b"mem", floats(&[(1, 0.5)])).unwrap();

        let snapshot = cache.snapshot().unwrap();
        assert_eq!(cache.size(), 0);
        assert_eq!(snapshot.size(), 48);
        assert_eq!(snapshot.values(b"cpu").len(), 2);

        // Reads through the live cache still see the snapshot data
        assert_eq!(cache.values(b"cpu").len(), 2);
        assert_eq!(cache.values(b"mem").len(), 1);
    }

    #[test]
    fn test_snapshot_in_progress() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1)])).unwrap();

        let _snapshot = cache.snapshot().unwrap();
        assert!(matches!(
            cache.snapshot().unwrap_err(),
            Error::SnapshotInProgress
        ));
    }

    #[test]
    fn test_snapshot_merged_with_new_writes() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1), (2, 0.2)])).unwrap();

        let _snapshot = cache.snapshot().unwrap();
        cache.write(b"cpu", floats(&[(3, 0.3)])).unwrap();

        let values = cache.values(b"cpu");
        let ts: Vec<i64> = values.iter().map(|v| v.timestamp).collect();
        assert_eq!(ts, vec![1, 2, 3]);
    }

    #[test]
    fn test_snapshot_merge_overwrites_snapshot_point() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1), (2, 0.2)])).unwrap();

        let _snapshot = cache.snapshot().unwrap();
        cache.write(b"cpu", floats(&[(2, 0.9)])).unwrap();

        let values = cache.values(b"cpu");
        assert_eq!(values, vec![Value::float(1, 0.1), Value::float(2, 0.9)]);
    }

    #[test]
    fn test_clear_snapshot_success_frees() {
        let (cache, arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1)])).unwrap();
        assert_eq!(arena.refcount(b"cpu"), Some(1));

        let _snapshot = cache.snapshot().unwrap();
        assert_eq!(arena.refcount(b"cpu"), Some(1));

        cache.clear_snapshot(true);
        assert_eq!(arena.refcount(b"cpu"), None);
        assert!(cache.values(b"cpu").is_empty());

        // A new snapshot may start afterwards
        cache.write(b"cpu", floats(&[(9, 0.9)])).unwrap();
        let snapshot = cache.snapshot().unwrap();
        assert_eq!(snapshot.values(b"cpu").len(), 1);
    }

    #[test]
    fn test_failed_snapshot_retry_merges_into_sibling() {
        let (cache, arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1)])).unwrap();

        let first = cache.snapshot().unwrap();
        cache.clear_snapshot(false);

        cache.write(b"cpu", floats(&[(2, 0.2)])).unwrap();
        let second = cache.snapshot().unwrap();

        // Same sibling, now holding both the old and the new values
        assert!(Arc::ptr_eq(&first, &second));
        let values = second.values(b"cpu");
        let ts: Vec<i64> = values.iter().map(|v| v.timestamp).collect();
        assert_eq!(ts, vec![1, 2]);

        // Exactly one sibling reference for the key
        assert_eq!(arena.refcount(b"cpu"), Some(1));

        cache.clear_snapshot(true);
        assert_eq!(arena.refcount(b"cpu"), None);
    }

    #[test]
    fn test_snapshot_frees_budget() {
        let (cache, _arena) = private_cache(64);
        cache
            .write(b"cpu", floats(&[(1, 0.1), (2, 0.2), (3, 0.3), (4, 0.4)]))
            .unwrap();

        // Budget is shared with the snapshot, so this still fails
        let _snapshot = cache.snapshot().unwrap();
        assert!(matches!(
            cache.write(b"cpu", floats(&[(5, 0.5)])).unwrap_err(),
            Error::CacheMemoryExceeded
        ));

        // Clearing the snapshot releases the shared budget
        cache.clear_snapshot(true);
        cache.write(b"cpu", floats(&[(5, 0.5)])).unwrap();
        assert_eq!(cache.size(), 16);
    }

    #[test]
    fn test_set_max_size() {
        let (cache, _arena) = private_cache(16);
        cache.write(b"cpu", floats(&[(1, 0.1)])).unwrap();
        assert!(cache.write(b"cpu", floats(&[(2, 0.2)])).is_err());

        cache.set_max_size(64);
        assert_eq!(cache.max_size(), 64);
        cache.write(b"cpu", floats(&[(2, 0.2)])).unwrap();
    }

    #[test]
    fn test_deduplicate_all_entries() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(2, 0.2), (1, 0.1)])).unwrap();
        cache.write(b"mem", floats(&[(5, 0.5), (4, 0.4)])).unwrap();

        cache.deduplicate();
        assert_eq!(cache.values(b"cpu")[0].timestamp, 1);
        assert_eq!(cache.values(b"mem")[0].timestamp, 4);
    }

    #[test]
    fn test_statistics_snapshot() {
        let (cache, _arena) = private_cache(0);
        cache.write(b"cpu", floats(&[(1, 0.1), (2, 0.2)])).unwrap();

        let mut tags = HashMap::new();
        tags.insert("path".to_string(), "/data".to_string());
        let stats = cache.statistics(tags);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "tsm1_cache");
        assert_eq!(stats[0].values["memBytes"], 32);

        let _snapshot = cache.snapshot().unwrap();
        let stats = cache.statistics(HashMap::new());
        assert_eq!(stats[0].values["memBytes"], 0);
        assert_eq!(stats[0].values["diskBytes"], 32);
        assert_eq!(stats[0].values["snapshotCount"], 1);
        assert_eq!(stats[0].values["cachedBytes"], 32);

        cache.clear_snapshot(true);
        let stats = cache.statistics(HashMap::new());
        assert_eq!(stats[0].values["diskBytes"], 0);
        assert_eq!(stats[0].values["snapshotCount"], 0);
        assert_eq!(stats[0].values["cachedBytes"], 32);
    }

    #[test]
    fn test_with_config() {
        let config = CacheConfig::default()
            .max_size(1024)
            .initial_series_capacity(16);
        let cache = Cache::with_config(config, Arc::new(KeyArena::new()));

        assert_eq!(cache.max_size(), 1024);
        cache.write(b"cpu", floats(&[(1, 0.1)])).unwrap();
        assert_eq!(cache.size(), 16);
    }

    #[test]
    fn test_update_compact_time_accumulates() {
        let (cache, _arena) = private_cache(0);
        cache.update_compact_time(Duration::from_millis(5));
        cache.update_compact_time(Duration::from_millis(7));
        let stats = cache.statistics(HashMap::new());
        assert_eq!(stats[0].values["WALCompactionTimeMs"], 12);
    }

    #[test]
    fn test_concurrent_writers_disjoint_series() {
        use std::thread;

        let (cache, _arena) = private_cache(0);
        let cache = Arc::new(cache);

        let mut handles = vec![];
        for t in 0..8i64 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                let key = format!("series_{}", t);
                for i in 0..100i64 {
                    let mut batches = HashMap::new();
                    batches.insert(key.clone().into_bytes(), vec![Value::integer(i, i)]);
                    cache.write_multi(batches).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.keys().len(), 8);
        assert_eq!(cache.size(), 8 * 100 * 16);
        for t in 0..8 {
            let key = format!("series_{}", t);
            assert_eq!(cache.values(key.as_bytes()).len(), 100);
        }
    }
}
