//! Keyed registry of shared per-request state.
//!
//! One mutex guards the whole map. Operations that must observe and change
//! the map atomically (create-or-update, conditional clear) run entirely
//! under it, so callers never see a half-applied update.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct Registry<K, V> {
    entries: Mutex<HashMap<K, Arc<V>>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.lock().get(key).cloned()
    }

    /// Returns the entry for `key`, creating it with `create` if absent.
    /// The flag is true when this call created it.
    pub fn get_or_insert_with(&self, key: K, create: impl FnOnce() -> V) -> (Arc<V>, bool) {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key) {
            return (Arc::clone(existing), false);
        }
        let value = Arc::new(create());
        entries.insert(key, Arc::clone(&value));
        (value, true)
    }

    /// Create-if-absent, then run `update` on the entry, all under the lock.
    pub fn update_or_insert_with<R>(
        &self,
        key: K,
        create: impl FnOnce() -> V,
        update: impl FnOnce(&Arc<V>) -> R,
    ) -> R {
        let mut entries = self.lock();
        let entry = entries.entry(key).or_insert_with(|| Arc::new(create()));
        update(entry)
    }

    pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
        self.lock().insert(key, Arc::new(value))
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.lock().remove(key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.lock().contains_key(key)
    }

    /// Point-in-time copy of the keys.
    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Vec<(K, Arc<V>)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn retain(&self, mut keep: impl FnMut(&K, &Arc<V>) -> bool) {
        self.lock().retain(|k, v| keep(k, v));
    }

    /// Clear the registry only if `pred` holds for the whole map.
    /// Returns true when entries were cleared.
    pub fn clear_if(&self, pred: impl FnOnce(&HashMap<K, Arc<V>>) -> bool) -> bool {
        let mut entries = self.lock();
        if entries.is_empty() || !pred(&entries) {
            return false;
        }
        entries.clear();
        true
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Arc<V>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
