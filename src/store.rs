//! In-memory record store with atomic read-modify-write
//!
//! Every mutation of a record goes through [`RecordStore::update`], which runs
//! the closure under the store lock. Closures are synchronous, so no lock is
//! ever held across an await point or across more than one record update.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Keyed records with compare-and-set style updates
#[derive(Debug)]
pub struct RecordStore<K, V> {
    records: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for RecordStore<K, V> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> RecordStore<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        // poisoned only if an update closure panicked
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a record
    pub fn insert(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }

    /// Snapshot of one record
    pub fn get(&self, key: K) -> Option<V> {
        self.lock().get(&key).cloned()
    }

    /// Whether a record exists
    pub fn contains(&self, key: K) -> bool {
        self.lock().contains_key(&key)
    }

    /// Atomically mutate one record; None if the key is unknown
    pub fn update<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.lock().get_mut(&key).map(f)
    }

    /// Snapshots of records matching a predicate
    pub fn filter(&self, mut predicate: impl FnMut(&V) -> bool) -> Vec<V> {
        self.lock()
            .values()
            .filter(|v| predicate(v))
            .cloned()
            .collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn update_returns_closure_result() {
        let store = RecordStore::new();
        store.insert(1u32, 10u32);
        let doubled = store.update(1, |v| {
            *v *= 2;
            *v
        });
        assert_eq!(doubled, Some(20));
        assert_eq!(store.update(2, |v| *v), None);
        assert_eq!(store.get(1), Some(20));
    }

    #[test]
    fn filter_returns_matching_snapshots() {
        let store = RecordStore::new();
        for i in 0..6u32 {
            store.insert(i, i);
        }
        let mut even = store.filter(|v| v % 2 == 0);
        even.sort();
        assert_eq!(even, vec![0, 2, 4]);
        assert_eq!(store.len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let store = Arc::new(RecordStore::new());
        store.insert(0u8, 0u64);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    store.update(0, |v| *v += 1);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get(0), Some(8000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn compare_and_set_has_single_winner() {
        let store = Arc::new(RecordStore::new());
        store.insert(0u8, false);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(0, |claimed| !std::mem::replace(claimed, true))
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
