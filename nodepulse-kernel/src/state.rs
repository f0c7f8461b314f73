use nodepulse_contracts::Sample;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

/// Map guarded by a reader/writer lock; readers get clones
#[derive(Debug)]
pub struct RwMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for RwMap<K, V> {
    fn default() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash, V: Clone> RwMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    pub fn set(&self, key: K, value: V) {
        self.inner.write().insert(key, value);
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        self.inner.write().remove(key)
    }
}

/// Latest sample per node id
pub type LiveCache = RwMap<String, Sample>;
