//! Versioned reference remote backed by a `KvStore`.
//!
//! # Responsibility
//! - Apply change records in order, assigning entity versions.
//! - Detect conflicts from `base_version` and report the current snapshot.
//! - Acknowledge replays of already applied records without touching state.
//!
//! # Invariants
//! - A record applied once is never applied again (`remote/applied/` marks).
//! - Consecutive writes from the device that made the current version are
//!   not conflicts; that device already saw its own writes.

use crate::model::change::{ChangeOperation, ChangeRecord, EntityRef};
use crate::model::entity::EntitySnapshot;
use crate::store::{KvStore, StoreError, StoreResult};
use crate::sync::remote::{RecordOutcome, RemoteService, TransportError};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const ENTITY_PREFIX: &str = "remote/entity/";
const APPLIED_PREFIX: &str = "remote/applied/";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteEntry {
    snapshot: EntitySnapshot,
    writer_device: String,
}

pub struct LoopbackRemote {
    store: Arc<dyn KvStore>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    write_lock: Mutex<()>,
}

impl LoopbackRemote {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// An unreachable remote fails every batch with `Unreachable`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay added before each batch is processed.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    pub fn snapshot(&self, entity: &EntityRef) -> StoreResult<Option<EntitySnapshot>> {
        Ok(self.load(entity)?.map(|entry| entry.snapshot))
    }

    /// Seeds or overwrites remote state as if `writer_device` wrote it.
    pub fn put_snapshot(&self, snapshot: &EntitySnapshot, writer_device: &str) -> StoreResult<()> {
        let entry = RemoteEntry {
            snapshot: snapshot.clone(),
            writer_device: writer_device.to_string(),
        };
        self.save(&entry)
    }

    /// Every remote entity, ordered by type then id.
    pub fn snapshots(&self) -> StoreResult<Vec<EntitySnapshot>> {
        self.store
            .list_prefix(ENTITY_PREFIX)?
            .into_iter()
            .map(|(key, raw)| decode_entry(&key, &raw).map(|entry| entry.snapshot))
            .collect()
    }

    pub fn applied_count(&self) -> StoreResult<usize> {
        Ok(self.store.list_prefix(APPLIED_PREFIX)?.len())
    }

    fn apply(&self, record: &ChangeRecord) -> StoreResult<RecordOutcome> {
        let applied_key = applied_key(record);
        if let Some(raw) = self.store.get(&applied_key)? {
            let version = raw.parse::<u64>().map_err(|err| StoreError::Corrupt {
                key: applied_key.clone(),
                message: err.to_string(),
            })?;
            debug!(
                "event=remote_replay module=sync status=ok change_id={}",
                record.id
            );
            return Ok(RecordOutcome::Ack {
                change_id: record.id,
                version,
            });
        }

        let entity = record.entity_ref();
        let current = self.load(&entity)?;
        if let Some(current) = &current {
            let based_on = record.base_version.unwrap_or(0);
            if current.snapshot.version != based_on && current.writer_device != record.device_id {
                return Ok(RecordOutcome::Conflict {
                    change_id: record.id,
                    remote: current.snapshot.clone(),
                });
            }
        }

        let version = current
            .as_ref()
            .map_or(1, |entry| entry.snapshot.version + 1);
        let snapshot = match record.operation {
            ChangeOperation::Delete => {
                let payload = current
                    .map(|entry| entry.snapshot.payload)
                    .unwrap_or(serde_json::Value::Null);
                EntitySnapshot {
                    deleted: true,
                    ..EntitySnapshot::new(&entity, version, payload, record.timestamp)
                }
            }
            ChangeOperation::Create | ChangeOperation::Update => {
                EntitySnapshot::new(&entity, version, record.payload.clone(), record.timestamp)
            }
        };
        self.save(&RemoteEntry {
            snapshot,
            writer_device: record.device_id.clone(),
        })?;
        self.store.set(&applied_key, &version.to_string())?;
        Ok(RecordOutcome::Ack {
            change_id: record.id,
            version,
        })
    }

    fn load(&self, entity: &EntityRef) -> StoreResult<Option<RemoteEntry>> {
        let key = entity_key(entity);
        match self.store.get(&key)? {
            Some(raw) => Ok(Some(decode_entry(&key, &raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, entry: &RemoteEntry) -> StoreResult<()> {
        let key = entity_key(&entry.snapshot.entity_ref());
        let json = serde_json::to_string(entry).map_err(|err| StoreError::Corrupt {
            key: key.clone(),
            message: err.to_string(),
        })?;
        self.store.set(&key, &json)
    }
}

impl RemoteService for LoopbackRemote {
    fn push_batch(&self, batch: &[ChangeRecord]) -> Result<Vec<RecordOutcome>, TransportError> {
        let latency_ms = self.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            thread::sleep(Duration::from_millis(latency_ms));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(
                "loopback remote is offline".to_string(),
            ));
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outcomes: Vec<RecordOutcome> = batch
            .iter()
            .map(|record| {
                self.apply(record)
                    .unwrap_or_else(|err| RecordOutcome::Error {
                        change_id: record.id,
                        message: err.to_string(),
                    })
            })
            .collect();
        info!(
            "event=remote_push module=sync status=ok records={}",
            outcomes.len()
        );
        Ok(outcomes)
    }
}

fn entity_key(entity: &EntityRef) -> String {
    format!(
        "{ENTITY_PREFIX}{}/{}",
        entity.entity_type, entity.entity_id
    )
}

fn applied_key(record: &ChangeRecord) -> String {
    format!("{APPLIED_PREFIX}{}/{:020}", record.device_id, record.id)
}

fn decode_entry(key: &str, raw: &str) -> StoreResult<RemoteEntry> {
    serde_json::from_str(raw).map_err(|err| StoreError::Corrupt {
        key: key.to_string(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::LoopbackRemote;
    use crate::model::change::{ChangeOperation, ChangeRecord, EntityRef, SyncStatus};
    use crate::model::entity::EntitySnapshot;
    use crate::store::MemoryKvStore;
    use crate::sync::remote::{RecordOutcome, RemoteService, TransportError};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn record(
        id: u64,
        device: &str,
        operation: ChangeOperation,
        payload: Value,
        base_version: Option<u64>,
    ) -> ChangeRecord {
        ChangeRecord {
            id,
            device_id: device.to_string(),
            entity_type: "todo".to_string(),
            entity_id: "t1".to_string(),
            operation,
            payload,
            base_version,
            timestamp: 100 + id as i64,
            sync_status: SyncStatus::Syncing,
            attempts: 1,
            last_error: None,
        }
    }

    fn remote() -> LoopbackRemote {
        LoopbackRemote::new(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn versions_increase_per_applied_record() {
        let remote = remote();
        let outcomes = remote
            .push_batch(&[
                record(1, "a", ChangeOperation::Create, json!({"v": 1}), None),
                record(2, "a", ChangeOperation::Update, json!({"v": 2}), Some(0)),
            ])
            .expect("push should succeed");
        assert_eq!(
            outcomes,
            vec![
                RecordOutcome::Ack { change_id: 1, version: 1 },
                RecordOutcome::Ack { change_id: 2, version: 2 },
            ]
        );
        let stored = remote
            .snapshot(&EntityRef::new("todo", "t1"))
            .expect("read")
            .expect("entity exists");
        assert_eq!(stored.payload, json!({"v": 2}));
    }

    #[test]
    fn replay_is_acknowledged_without_change() {
        let remote = remote();
        let create = record(1, "a", ChangeOperation::Create, json!({"v": 1}), None);
        remote.push_batch(&[create.clone()]).expect("first push");
        let before = remote.snapshots().expect("list");

        let outcomes = remote.push_batch(&[create]).expect("replay");
        assert_eq!(outcomes, vec![RecordOutcome::Ack { change_id: 1, version: 1 }]);
        assert_eq!(remote.snapshots().expect("list"), before);
        assert_eq!(remote.applied_count().expect("count"), 1);
    }

    #[test]
    fn stale_write_from_other_device_conflicts() {
        let remote = remote();
        let entity = EntityRef::new("todo", "t1");
        let theirs = EntitySnapshot::new(&entity, 4, json!({"v": "theirs"}), 50);
        remote.put_snapshot(&theirs, "b").expect("seed");

        let outcomes = remote
            .push_batch(&[record(1, "a", ChangeOperation::Update, json!({"v": 1}), Some(3))])
            .expect("push");
        assert_eq!(
            outcomes,
            vec![RecordOutcome::Conflict {
                change_id: 1,
                remote: theirs,
            }]
        );
    }

    #[test]
    fn delete_keeps_payload_as_tombstone() {
        let remote = remote();
        remote
            .push_batch(&[
                record(1, "a", ChangeOperation::Create, json!({"v": 1}), None),
                record(2, "a", ChangeOperation::Delete, Value::Null, Some(1)),
            ])
            .expect("push");
        let stored = remote
            .snapshot(&EntityRef::new("todo", "t1"))
            .expect("read")
            .expect("tombstone exists");
        assert!(stored.deleted);
        assert_eq!(stored.payload, json!({"v": 1}));
    }

    #[test]
    fn unreachable_remote_fails_whole_batch() {
        let remote = remote();
        remote.set_reachable(false);
        let err = remote
            .push_batch(&[record(1, "a", ChangeOperation::Create, json!({}), None)])
            .expect_err("offline remote must fail");
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
