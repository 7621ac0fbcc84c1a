//! Ordered map from `i32` keys to values.
//!
//! Used for channel, connection, and group indexing inside the transport.
//! Iteration yields ascending keys. Readers get a consistent point-in-time
//! view even while a writer is mutating the map.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct IntMap<V> {
    inner: RwLock<BTreeMap<i32, V>>,
}

impl<V> Default for IntMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntMap<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<i32, V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<i32, V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `value` under `key`, returning the displaced value if the key
    /// was already present.
    pub fn insert(&self, key: i32, value: V) -> Option<V> {
        self.write().insert(key, value)
    }

    pub fn remove(&self, key: i32) -> Option<V> {
        self.write().remove(&key)
    }

    pub fn contains(&self, key: i32) -> bool {
        self.read().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove every entry, returning them in ascending key order.
    pub fn drain(&self) -> Vec<(i32, V)> {
        let mut map = self.write();
        std::mem::take(&mut *map).into_iter().collect()
    }
}

impl<V: Clone> IntMap<V> {
    pub fn get(&self, key: i32) -> Option<V> {
        self.read().get(&key).cloned()
    }

    pub fn first(&self) -> Option<(i32, V)> {
        self.read().iter().next().map(|(k, v)| (*k, v.clone()))
    }

    pub fn last(&self) -> Option<(i32, V)> {
        self.read().iter().next_back().map(|(k, v)| (*k, v.clone()))
    }

    /// Smallest entry with a key strictly greater than `key`.
    pub fn next_above(&self, key: i32) -> Option<(i32, V)> {
        self.read()
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (*k, v.clone()))
    }

    /// Largest entry with a key strictly less than `key`.
    pub fn prev_below(&self, key: i32) -> Option<(i32, V)> {
        self.read()
            .range((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, v)| (*k, v.clone()))
    }

    /// Point-in-time copy of the map contents in ascending key order.
    /// Mutations after the call do not affect the returned snapshot.
    pub fn snapshot(&self) -> Vec<(i32, V)> {
        self.read().iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn insert_get_remove() {
        let map = IntMap::new();
        assert_eq!(map.insert(3, "c"), None);
        assert_eq!(map.insert(1, "a"), None);
        assert_eq!(map.insert(3, "c2"), Some("c"));
        assert_eq!(map.get(3), Some("c2"));
        assert_eq!(map.remove(1), Some("a"));
        assert_eq!(map.get(1), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn ordered_navigation() {
        let map = IntMap::new();
        for k in [10, -5, 0, 42] {
            map.insert(k, k * 2);
        }
        assert_eq!(map.first(), Some((-5, -10)));
        assert_eq!(map.last(), Some((42, 84)));
        assert_eq!(map.next_above(0), Some((10, 20)));
        assert_eq!(map.next_above(42), None);
        assert_eq!(map.prev_below(0), Some((-5, -10)));
        assert_eq!(map.prev_below(-5), None);
    }

    #[test]
    fn snapshot_is_point_in_time() {
        let map = IntMap::new();
        map.insert(2, "b");
        map.insert(1, "a");
        let snap = map.snapshot();
        map.insert(0, "z");
        map.remove(2);
        assert_eq!(snap, vec![(1, "a"), (2, "b")]);
        assert_eq!(map.snapshot(), vec![(0, "z"), (1, "a")]);
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let map = Arc::new(IntMap::new());
        for k in 0..100 {
            map.insert(k, k);
        }

        let writer = {
            let map = Arc::clone(&map);
            std::thread::spawn(move || {
                for k in 100..200 {
                    map.insert(k, k);
                    map.remove(k - 100);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let snap = map.snapshot();
                        // Snapshots are always internally ordered.
                        assert!(snap.windows(2).all(|w| w[0].0 < w[1].0));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(map.len(), 100);
    }
}
