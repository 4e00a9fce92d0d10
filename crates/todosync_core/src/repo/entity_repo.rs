//! Local entity state.
//!
//! # Responsibility
//! - Hold the materialized snapshot of every entity this device knows,
//!   including the last remote version it has seen.
//!
//! # Invariants
//! - Writes never fail: storage outages are buffered like change log writes.
//! - Deletes are tombstones so a later remote version can still be compared.

use crate::error::SyncResult;
use crate::model::change::EntityRef;
use crate::model::entity::EntitySnapshot;
use crate::store::{BufferedKvStore, KvStore, StoreError};
use log::error;
use std::sync::Arc;

const ENTITY_PREFIX: &str = "entity/";

pub trait EntityRepository: Send + Sync {
    fn get_entity(&self, entity: &EntityRef) -> SyncResult<Option<EntitySnapshot>>;
    fn put_entity(&self, snapshot: &EntitySnapshot);
    /// Snapshots of one entity type ordered by entity id.
    fn list_entities(&self, entity_type: &str) -> SyncResult<Vec<EntitySnapshot>>;
}

/// Entity repository over the host key-value store.
pub struct KvEntityRepository {
    store: BufferedKvStore,
}

impl KvEntityRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store: BufferedKvStore::new(store),
        }
    }

    pub fn flush(&self) -> SyncResult<usize> {
        Ok(self.store.flush()?)
    }

    pub fn buffered_count(&self) -> usize {
        self.store.buffered_len()
    }
}

impl EntityRepository for KvEntityRepository {
    fn get_entity(&self, entity: &EntityRef) -> SyncResult<Option<EntitySnapshot>> {
        let key = entity_key(&entity.entity_type, &entity.entity_id);
        match self.store.get(&key)? {
            Some(raw) => Ok(Some(decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    fn put_entity(&self, snapshot: &EntitySnapshot) {
        let key = entity_key(&snapshot.entity_type, &snapshot.entity_id);
        match serde_json::to_string(snapshot) {
            Ok(json) => self.store.put(&key, &json),
            Err(err) => error!(
                "event=entity_persist module=repo status=error entity_type={} error={}",
                snapshot.entity_type, err
            ),
        }
    }

    fn list_entities(&self, entity_type: &str) -> SyncResult<Vec<EntitySnapshot>> {
        let prefix = format!("{ENTITY_PREFIX}{entity_type}/");
        self.store
            .list_prefix(&prefix)?
            .into_iter()
            .map(|(key, raw)| decode(&key, &raw).map_err(Into::into))
            .collect()
    }
}

fn entity_key(entity_type: &str, entity_id: &str) -> String {
    format!("{ENTITY_PREFIX}{entity_type}/{entity_id}")
}

fn decode(key: &str, raw: &str) -> Result<EntitySnapshot, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Corrupt {
        key: key.to_string(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::{EntityRepository, KvEntityRepository};
    use crate::error::SyncError;
    use crate::model::change::EntityRef;
    use crate::model::entity::EntitySnapshot;
    use crate::store::{KvStore, MemoryKvStore};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn put_then_get_and_list_by_type() {
        let repo = KvEntityRepository::new(Arc::new(MemoryKvStore::new()));
        let a = EntitySnapshot::new(&EntityRef::new("todo", "a"), 0, json!({"n": 1}), 5);
        let b = EntitySnapshot::new(&EntityRef::new("todo", "b"), 3, json!({"n": 2}), 6);
        let other = EntitySnapshot::new(&EntityRef::new("tag", "a"), 1, json!({}), 7);
        repo.put_entity(&b);
        repo.put_entity(&a);
        repo.put_entity(&other);

        let loaded = repo
            .get_entity(&EntityRef::new("todo", "b"))
            .expect("get should succeed")
            .expect("entity should exist");
        assert_eq!(loaded, b);

        let listed = repo.list_entities("todo").expect("list should succeed");
        assert_eq!(listed, vec![a, b]);
    }

    #[test]
    fn corrupt_rows_are_reported() {
        let inner = Arc::new(MemoryKvStore::new());
        inner.set("entity/todo/x", "{not json").expect("seed");
        let repo = KvEntityRepository::new(inner);

        let err = repo
            .get_entity(&EntityRef::new("todo", "x"))
            .expect_err("corrupt row must fail");
        assert!(matches!(err, SyncError::Storage(_)));
    }

    #[test]
    fn writes_survive_outage() {
        let inner = Arc::new(MemoryKvStore::new());
        let repo = KvEntityRepository::new(inner.clone());
        let snapshot = EntitySnapshot::new(&EntityRef::new("todo", "a"), 0, json!({}), 1);

        inner.set_available(false);
        repo.put_entity(&snapshot);
        assert_eq!(repo.buffered_count(), 1);

        inner.set_available(true);
        assert_eq!(repo.flush().expect("flush"), 1);
        assert!(inner.get("entity/todo/a").expect("get").is_some());
    }
}
