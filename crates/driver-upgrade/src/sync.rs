//! Synchronisation primitives keyed by node name.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes async critical sections per key, e.g. all writes to one node.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder of `key` is left and returns a guard releasing it on drop.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop locks nobody holds or waits for.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_owned()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// A shared set of node names with work in flight.
#[derive(Clone, Debug, Default)]
pub struct StringSet {
    inner: Arc<Mutex<BTreeSet<String>>>,
}

impl StringSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value`, returning `false` if it was already present.
    pub fn insert(&self, value: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(value.to_owned())
    }

    pub fn remove(&self, value: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(value)
    }

    pub fn contains(&self, value: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(value)
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Inserts `value` and returns a guard removing it again when dropped, or `None` if the value
    /// is already present.
    pub fn claim(&self, value: &str) -> Option<StringSetGuard> {
        self.insert(value).then(|| StringSetGuard {
            set: self.clone(),
            value: value.to_owned(),
        })
    }
}

/// Removes its value from the [`StringSet`] on drop.
#[derive(Debug)]
pub struct StringSetGuard {
    set: StringSet,
    value: String,
}

impl Drop for StringSetGuard {
    fn drop(&mut self) {
        self.set.remove(&self.value);
    }
}
