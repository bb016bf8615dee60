//! Per-series buffer of values
//!
//! An entry owns the values buffered for one series along with a flag that
//! records whether the sequence may be unsorted or carry duplicate
//! timestamps. Writers append batches cheaply; sorting and deduplication are
//! deferred until a reader or the compactor needs ordered data.

use parking_lot::RwLock;

use crate::types::{Timestamp, Value, ValueType};
use crate::values::{FieldTypeError, ValuesExt};

#[derive(Debug, Default)]
struct EntryInner {
    /// All buffered values, in arrival order until deduplicated
    values: Vec<Value>,
    /// True if the values may be out of order or contain duplicates
    needs_sort: bool,
}

/// Buffered values for a single series
///
/// Each entry carries its own reader/writer lock, so appends to different
/// series proceed concurrently without touching the cache-wide lock.
///
/// Invariant: when `needs_sort` is false the sequence is strictly increasing
/// by timestamp and duplicate-free. `deduplicate` restores the invariant
/// after unsorted appends.
#[derive(Debug, Default)]
pub(crate) struct Entry {
    inner: RwLock<EntryInner>,
}

impl Entry {
    /// Append a batch of values
    ///
    /// The sequence is marked as needing a sort if the batch itself is not
    /// strictly increasing, or if it overlaps the current tail timestamp. An
    /// empty entry absorbs the batch without copying.
    pub(crate) fn add(&self, batch: Vec<Value>) {
        let batch_unsorted = !batch.is_strictly_ordered();

        let mut inner = self.inner.write();
        if batch_unsorted {
            inner.needs_sort = true;
        }
        if inner.values.is_empty() {
            inner.values = batch;
            return;
        }
        if let (Some(last), Some(first)) = (inner.values.last(), batch.first()) {
            if last.timestamp >= first.timestamp {
                inner.needs_sort = true;
            }
        }
        inner.values.extend(batch);
    }

    /// Append values copied from a slice, with the same flag handling as `add`
    pub(crate) fn extend_from(&self, batch: &[Value]) {
        self.add(batch.to_vec());
    }

    /// Sort and deduplicate the buffered values
    ///
    /// No-op when the sequence is already ordered or empty.
    pub(crate) fn deduplicate(&self) {
        let mut inner = self.inner.write();
        if !inner.needs_sort || inner.values.is_empty() {
            return;
        }
        let deduped = inner.values.deduplicate();
        inner.values = deduped;
        inner.needs_sort = false;
    }

    /// Remove all values with timestamps in `min..=max`
    ///
    /// Relative order is preserved, so the sort status does not change.
    pub(crate) fn filter(&self, min: Timestamp, max: Timestamp) {
        let mut inner = self.inner.write();
        let remaining = inner.values.exclude(min, max);
        inner.values = remaining;
    }

    /// Number of buffered values
    pub(crate) fn count(&self) -> usize {
        self.inner.read().values.len()
    }

    /// Byte footprint of the buffered values
    pub(crate) fn size(&self) -> usize {
        self.inner.read().values.byte_size()
    }

    /// Whether the sequence may need sorting
    pub(crate) fn needs_sort(&self) -> bool {
        self.inner.read().needs_sort
    }

    /// Force the unsorted flag, used when merging another entry's values in
    pub(crate) fn mark_unsorted(&self) {
        self.inner.write().needs_sort = true;
    }

    /// Common payload type of the buffered values
    pub(crate) fn value_type(&self) -> Result<ValueType, FieldTypeError> {
        self.inner.read().values.value_type()
    }

    /// Run `f` against the buffered values under the read lock
    pub(crate) fn with_values<R>(&self, f: impl FnOnce(&[Value]) -> R) -> R {
        f(&self.inner.read().values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(points: &[(i64, f64)]) -> Vec<Value> {
        points.iter().map(|&(ts, v)| Value::float(ts, v)).collect()
    }

    #[test]
    fn test_add_sorted_batch() {
        let entry = Entry::default();
        entry.add(floats(&[(1, 0.1), (2, 0.2), (3, 0.3)]));
        assert_eq!(entry.count(), 3);
        assert!(!entry.needs_sort());
    }

    #[test]
    fn test_add_unsorted_batch_sets_flag() {
        let entry = Entry::default();
        entry.add(floats(&[(2, 0.2), (1, 0.1)]));
        assert!(entry.needs_sort());
    }

    #[test]
    fn test_add_duplicate_in_batch_sets_flag() {
        let entry = Entry::default();
        entry.add(floats(&[(1, 0.1), (1, 0.2)]));
        assert!(entry.needs_sort());
    }

    #[test]
    fn test_add_overlapping_tail_sets_flag() {
        let entry = Entry::default();
        entry.add(floats(&[(1, 0.1), (5, 0.5)]));
        assert!(!entry.needs_sort());

        // First timestamp equals the current tail
        entry.add(floats(&[(5, 0.9), (6, 0.6)]));
        assert!(entry.needs_sort());
    }

    #[test]
    fn test_add_appending_batch_keeps_flag_clear() {
        let entry = Entry::default();
        entry.add(floats(&[(1, 0.1), (2, 0.2)]));
        entry.add(floats(&[(3, 0.3), (4, 0.4)]));
        assert!(!entry.needs_sort());
        assert_eq!(entry.count(), 4);
    }

    #[test]
    fn test_deduplicate_restores_invariant() {
        let entry = Entry::default();
        entry.add(floats(&[(3, 0.3), (1, 0.1), (2, 0.2), (1, 0.9)]));
        assert!(entry.needs_sort());

        entry.deduplicate();
        assert!(!entry.needs_sort());
        assert_eq!(entry.count(), 3);
        entry.with_values(|vals| {
            assert_eq!(vals[0], Value::float(1, 0.9));
            assert_eq!(vals[1], Value::float(2, 0.2));
            assert_eq!(vals[2], Value::float(3, 0.3));
        });
    }

    #[test]
    fn test_deduplicate_noop_when_sorted() {
        let entry = Entry::default();
        entry.add(floats(&[(1, 0.1), (2, 0.2)]));
        entry.deduplicate();
        assert_eq!(entry.count(), 2);
        assert!(!entry.needs_sort());
    }

    #[test]
    fn test_filter_range() {
        let entry = Entry::default();
        entry.add(floats(&[(1, 0.1), (5, 0.5), (10, 1.0)]));
        let before = entry.size();

        entry.filter(4, 8);
        assert_eq!(entry.count(), 2);
        assert_eq!(before - entry.size(), Value::float(5, 0.5).size());
        assert!(!entry.needs_sort());
    }

    #[test]
    fn test_size_accounting() {
        let entry = Entry::default();
        assert_eq!(entry.size(), 0);
        entry.add(floats(&[(1, 0.1), (2, 0.2)]));
        assert_eq!(entry.size(), 32);
    }

    #[test]
    fn test_concurrent_adds() {
        use std::sync::Arc;
        use std::thread;

        let entry = Arc::new(Entry::default());
        let mut handles = vec![];
        for t in 0..4i64 {
            let entry = Arc::clone(&entry);
            handles.push(thread::spawn(move || {
                for i in 0..100i64 {
                    entry.add(vec![Value::integer(t * 1000 + i, i)]);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(entry.count(), 400);

        entry.deduplicate();
        assert_eq!(entry.count(), 400);
        entry.with_values(|vals| assert!(vals.is_strictly_ordered()));
    }
}
