//! Bulk allocation of cache entries
//!
//! A new entry is allocated once per series-first-seen, which at high
//! cardinality happens in bursts (startup replay, series churn). The pool
//! builds entries a slab at a time and hands them out one by one, refilling
//! with a fresh slab when the current one runs dry. Handed-out entries are
//! always freshly constructed: empty and marked sorted.

use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use super::entry::Entry;

/// Entries constructed per refill
const SLAB_SIZE: usize = 1024;

lazy_static! {
    pub(crate) static ref ENTRY_POOL: EntryPool = EntryPool::new();
}

/// Slab allocator for cache entries
#[derive(Debug)]
pub(crate) struct EntryPool {
    free: Mutex<Vec<Arc<Entry>>>,
}

impl EntryPool {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take one fresh entry, refilling the slab first if it is exhausted
    pub(crate) fn acquire(&self) -> Arc<Entry> {
        let mut free = self.free.lock();
        if free.is_empty() {
            free.reserve(SLAB_SIZE);
            free.extend((0..SLAB_SIZE).map(|_| Arc::new(Entry::default())));
        }
        // The slab was just refilled if it was empty
        free.pop().unwrap_or_else(|| Arc::new(Entry::default()))
    }
}
