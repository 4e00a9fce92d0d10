//! Write-behind wrapper that never loses a write.
//!
//! # Responsibility
//! - Absorb write failures of the wrapped store by buffering in memory.
//! - Replay buffered writes in key order on the next call or `flush()`.
//!
//! # Invariants
//! - Reads observe buffered writes before the wrapped store.
//! - While anything is buffered, new writes join the buffer so a stale
//!   buffered value can never overwrite a newer stored one.

use super::{KvStore, StoreResult};
use log::{info, warn};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

/// `None` marks a buffered delete.
type Overlay = BTreeMap<String, Option<String>>;

pub struct BufferedKvStore {
    inner: Arc<dyn KvStore>,
    overlay: Mutex<Overlay>,
}

impl BufferedKvStore {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            overlay: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of writes waiting for the wrapped store.
    pub fn buffered_len(&self) -> usize {
        self.overlay().len()
    }

    /// Replays buffered writes.
    ///
    /// Returns how many writes reached the wrapped store. Stops at the first
    /// failure and returns it; the remaining writes stay buffered.
    pub fn flush(&self) -> StoreResult<usize> {
        let mut overlay = self.overlay();
        flush_locked(self.inner.as_ref(), &mut overlay)
    }

    /// Writes `value`, buffering it when the wrapped store fails.
    pub fn put(&self, key: &str, value: &str) {
        self.write(key, Some(value));
    }

    /// Deletes `key`, buffering the delete when the wrapped store fails.
    pub fn remove(&self, key: &str) {
        self.write(key, None);
    }

    fn overlay(&self) -> MutexGuard<'_, Overlay> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.overlay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, key: &str, value: Option<&str>) {
        let mut overlay = self.overlay();
        if !overlay.is_empty() {
            let _ = flush_locked(self.inner.as_ref(), &mut overlay);
        }
        if overlay.is_empty() {
            let result = match value {
                Some(value) => self.inner.set(key, value),
                None => self.inner.delete(key),
            };
            match result {
                Ok(()) => return,
                Err(err) => warn!(
                    "event=store_write module=store status=buffered key_prefix={} error={}",
                    key_prefix(key),
                    err
                ),
            }
        }
        overlay.insert(key.to_string(), value.map(str::to_string));
    }
}

impl KvStore for BufferedKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        if let Some(buffered) = self.overlay().get(key) {
            return Ok(buffered.clone());
        }
        self.inner.get(key)
    }

    /// Always succeeds; failures are buffered.
    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.put(key, value);
        Ok(())
    }

    /// Always succeeds; failures are buffered.
    fn delete(&self, key: &str) -> StoreResult<()> {
        self.remove(key);
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let overlay = self.overlay();
        let stored = self.inner.list_prefix(prefix)?;
        let mut merged: BTreeMap<String, String> = stored.into_iter().collect();
        for (key, value) in overlay
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

fn flush_locked(inner: &dyn KvStore, overlay: &mut Overlay) -> StoreResult<usize> {
    let mut flushed = 0;
    while let Some((key, value)) = overlay.pop_first() {
        let result = match &value {
            Some(value) => inner.set(&key, value),
            None => inner.delete(&key),
        };
        if let Err(err) = result {
            overlay.insert(key, value);
            return Err(err);
        }
        flushed += 1;
    }
    if flushed > 0 {
        info!(
            "event=store_flush module=store status=ok flushed={}",
            flushed
        );
    }
    Ok(flushed)
}

/// First path segment only; keys can embed entity ids.
fn key_prefix(key: &str) -> &str {
    key.split('/').next().unwrap_or(key)
}
