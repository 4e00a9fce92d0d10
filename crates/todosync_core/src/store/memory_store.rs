//! In-memory key-value store with an availability switch.
//!
//! Used by tests and ephemeral hosts. Toggling availability simulates a
//! persistence medium that comes and goes (locked file, unmounted volume).

use super::{KvStore, StoreError, StoreResult};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
    available: AtomicBool,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Makes every subsequent call succeed (`true`) or fail with
    /// `StoreError::Unavailable` (`false`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of stored entries, regardless of availability.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> StoreResult<MutexGuard<'_, BTreeMap<String, String>>> {
        if !self.is_available() {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let entries = self.entries()?;
        Ok(entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryKvStore;
    use crate::store::{KvStore, StoreError};

    #[test]
    fn unavailable_store_rejects_every_call() {
        let store = MemoryKvStore::new();
        store.set("k", "v").expect("set should succeed");

        store.set_available(false);
        assert!(matches!(store.get("k"), Err(StoreError::Unavailable(_))));
        assert!(matches!(store.set("k", "w"), Err(StoreError::Unavailable(_))));

        store.set_available(true);
        assert_eq!(store.get("k").expect("get").as_deref(), Some("v"));
    }

    #[test]
    fn list_prefix_stops_at_prefix_boundary() {
        let store = MemoryKvStore::new();
        store.set("a/2", "2").expect("set");
        store.set("a/1", "1").expect("set");
        store.set("ab", "x").expect("set");

        let keys: Vec<String> = store
            .list_prefix("a/")
            .expect("list")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["a/1".to_string(), "a/2".to_string()]);
    }
}
