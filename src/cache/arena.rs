//! Refcounted interning of series key bytes
//!
//! Series keys recur across millions of writes and are shared between the
//! live cache and its snapshots. Interning stores each distinct key once and
//! turns key comparisons into handle identity checks. Refcounts track how
//! many caches hold a key; when the count drops to zero the arena forgets it.
//!
//! # Thread Safety
//!
//! All arena operations are serialized by a single mutex and are
//! linearizable. Handles (`OwnedKey`) are cheap to clone and safe to use
//! from any thread.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;

lazy_static! {
    static ref GLOBAL_ARENA: Arc<KeyArena> = Arc::new(KeyArena::new());
}

/// A canonical, refcounted handle to a series key's bytes
///
/// Handles for equal byte content produced by the same arena share one
/// allocation, so equality is a pointer comparison. Hashing is by content,
/// which keeps map lookups by plain byte slices working.
#[derive(Clone)]
pub struct OwnedKey(Arc<[u8]>);

impl OwnedKey {
    /// The key's bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for OwnedKey {
    fn eq(&self, other: &Self) -> bool {
        // Equal content implies pointer equality: keys are canonicalized
        // through the arena that produced them.
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for OwnedKey {}

impl Hash for OwnedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_ref().hash(state);
    }
}

impl Borrow<[u8]> for OwnedKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for OwnedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Refcounted canonical storage of key bytes
#[derive(Debug, Default)]
pub struct KeyArena {
    slots: Mutex<HashMap<OwnedKey, usize>>,
}

impl KeyArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide default arena
    ///
    /// Caches constructed without an explicit arena share this one.
    pub fn global() -> Arc<KeyArena> {
        Arc::clone(&GLOBAL_ARENA)
    }

    /// Return the canonical handle for `key`, raising its refcount by one
    pub fn get_owned(&self, key: &[u8]) -> OwnedKey {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get_key_value(key).map(|(k, _)| k.clone()) {
            if let Some(count) = slots.get_mut(key) {
                *count += 1;
            }
            return existing;
        }
        let owned = OwnedKey(Arc::from(key));
        slots.insert(owned.clone(), 1);
        owned
    }

    /// Raise the refcount of an interned key by `n`
    pub fn inc(&self, key: &OwnedKey, n: usize) {
        let mut slots = self.slots.lock();
        if let Some(count) = slots.get_mut(key.as_bytes()) {
            *count += n;
        }
    }

    /// Lower the refcount of an interned key by `n`
    ///
    /// When the count reaches zero the key is removed from the arena.
    pub fn dec(&self, key: &OwnedKey, n: usize) {
        let mut slots = self.slots.lock();
        let remove = match slots.get_mut(key.as_bytes()) {
            Some(count) if *count > n => {
                *count -= n;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            slots.remove(key.as_bytes());
        }
    }

    /// Current refcount of a key, if interned
    pub fn refcount(&self, key: &[u8]) -> Option<usize> {
        self.slots.lock().get(key).copied()
    }

    /// Number of distinct keys held by the arena
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the arena holds no keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
