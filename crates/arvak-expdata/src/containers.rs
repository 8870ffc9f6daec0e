//! Lock-guarded collections shared between the foreground API and
//! background tasks.
//!
//! Every method on [`ThreadSafeOrderedMap`] and [`ThreadSafeList`] is a
//! single critical section. Callers that need several steps to be atomic
//! take the guard with `lock()` and work on the plain collection behind it.
//! Guards must never be held across an `.await`.

use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

/// Insertion-ordered map with unique keys.
///
/// Replacing a value keeps its original position; removing a key keeps the
/// relative order of the remaining entries.
#[derive(Clone)]
pub struct OrderedMap<K, V> {
    entries: Vec<(K, V)>,
    index: FxHashMap<K, usize>,
}

impl<K, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
        }
    }
}

impl<K: Eq + Hash + Clone, V> OrderedMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    /// Mutable value stored under `key`.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.index.get(key).map(|&i| &mut self.entries[i].1)
    }

    /// Entry at insertion position `position`.
    pub fn get_index(&self, position: usize) -> Option<(&K, &V)> {
        self.entries.get(position).map(|(k, v)| (k, v))
    }

    /// Insertion position of `key`.
    pub fn position(&self, key: &K) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&i) = self.index.get(&key) {
            return Some(std::mem::replace(&mut self.entries[i].1, value));
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        None
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        self.reindex_from(i);
        Some(value)
    }

    /// Keep only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        self.entries.retain(|(k, v)| keep(k, v));
        self.index.clear();
        self.reindex_from(0);
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &K> + ExactSizeIterator {
        self.entries.iter().map(|(k, _)| k)
    }

    /// Values in insertion order.
    pub fn values(&self) -> impl DoubleEndedIterator<Item = &V> + ExactSizeIterator {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&K, &V)> + ExactSizeIterator {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    fn reindex_from(&mut self, start: usize) {
        for (i, (k, _)) in self.entries.iter().enumerate().skip(start) {
            self.index.insert(k.clone(), i);
        }
    }
}

impl<K: Eq + Hash + Clone, V> FromIterator<(K, V)> for OrderedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for OrderedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

/// An [`OrderedMap`] behind a mutex.
pub struct ThreadSafeOrderedMap<K, V> {
    inner: Mutex<OrderedMap<K, V>>,
}

impl<K, V> Default for ThreadSafeOrderedMap<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(OrderedMap::default()),
        }
    }
}

impl<K: Eq + Hash + Clone, V> ThreadSafeOrderedMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a multi-step critical section.
    pub fn lock(&self) -> MutexGuard<'_, OrderedMap<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.lock().insert(key, value)
    }

    /// Remove a key.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    /// Apply `f` to the value under `key` while holding the lock.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.lock().get_mut(key).map(f)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ThreadSafeOrderedMap<K, V> {
    /// Clone of the value under `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    /// Clone of the entry at insertion position `position`.
    pub fn get_index(&self, position: usize) -> Option<(K, V)> {
        self.lock()
            .get_index(position)
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Values in insertion order.
    pub fn values(&self) -> Vec<V> {
        self.lock().values().cloned().collect()
    }

    /// Entries in insertion order.
    pub fn items(&self) -> Vec<(K, V)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Shallow copy of the current contents.
    pub fn snapshot(&self) -> OrderedMap<K, V> {
        self.lock().clone()
    }

    /// Independent container holding a copy of the current contents.
    pub fn copy_object(&self) -> Self {
        Self::from(self.snapshot())
    }
}

impl<K, V> From<OrderedMap<K, V>> for ThreadSafeOrderedMap<K, V> {
    fn from(map: OrderedMap<K, V>) -> Self {
        Self {
            inner: Mutex::new(map),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for ThreadSafeOrderedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        fmt::Debug::fmt(&*guard, f)
    }
}

/// A `Vec` behind a mutex.
pub struct ThreadSafeList<T> {
    inner: Mutex<Vec<T>>,
}

impl<T> Default for ThreadSafeList<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }
}

impl<T> ThreadSafeList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a multi-step critical section.
    pub fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one item.
    pub fn push(&self, item: T) {
        self.lock().push(item);
    }

    /// Append a batch under a single lock hold.
    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        self.lock().extend(items);
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T: Clone> ThreadSafeList<T> {
    /// Clone of the item at `index`.
    pub fn get(&self, index: usize) -> Option<T> {
        self.lock().get(index).cloned()
    }

    /// Shallow copy of the current contents.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }

    /// Independent container holding a copy of the current contents.
    pub fn copy_object(&self) -> Self {
        Self::from(self.snapshot())
    }
}

impl<T> From<Vec<T>> for ThreadSafeList<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            inner: Mutex::new(items),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ThreadSafeList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_list().entries(guard.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ordered_map_replace_keeps_position() {
        let mut map = OrderedMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);
        assert_eq!(map.insert("a", 10), Some(1));

        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(map.get(&"a"), Some(&10));
    }

    #[test]
    fn test_ordered_map_remove_reindexes() {
        let mut map: OrderedMap<_, _> = [("a", 1), ("b", 2), ("c", 3)].into_iter().collect();
        assert_eq!(map.remove(&"b"), Some(2));
        assert_eq!(map.remove(&"b"), None);

        assert_eq!(map.get_index(1), Some((&"c", &3)));
        assert_eq!(map.position(&"c"), Some(1));
        assert_eq!(map.get(&"c"), Some(&3));
    }

    #[test]
    fn test_ordered_map_retain() {
        let mut map: OrderedMap<_, _> = (0..6).map(|i| (i, i * 10)).collect();
        map.retain(|k, _| k % 2 == 1);

        assert_eq!(map.len(), 3);
        assert_eq!(map.position(&5), Some(2));
        assert_eq!(map.values().rev().next(), Some(&50));
    }

    #[test]
    fn test_thread_safe_map_copy_object_is_independent() {
        let map = ThreadSafeOrderedMap::new();
        map.insert("x".to_string(), 1);
        let copy = map.copy_object();
        copy.insert("y".to_string(), 2);

        assert_eq!(map.len(), 1);
        assert_eq!(copy.keys(), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_thread_safe_map_update() {
        let map = ThreadSafeOrderedMap::new();
        map.insert(1, vec![1]);
        assert_eq!(map.update(&1, |v| { v.push(2); v.len() }), Some(2));
        assert_eq!(map.update(&2, |v| v.len()), None);
        assert_eq!(map.get(&1), Some(vec![1, 2]));
    }

    #[test]
    fn test_thread_safe_list_concurrent_push() {
        let list = Arc::new(ThreadSafeList::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let list = list.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        list.push(t * 100 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(list.len(), 800);
        let mut items = list.snapshot();
        items.sort_unstable();
        assert_eq!(items, (0..800).collect::<Vec<_>>());
    }
}
