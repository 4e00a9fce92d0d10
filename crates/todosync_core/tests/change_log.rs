use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use todosync_core::{
    ChangeLog, ChangeOperation, EntityRef, KvStore, ManualClock, MemoryKvStore, SqliteKvStore,
    SyncError, SyncStatus,
};

fn open_log(store: Arc<dyn KvStore>) -> ChangeLog {
    ChangeLog::open(store, "device-a", Arc::new(ManualClock::new(1_000))).unwrap()
}

fn operation_strategy() -> impl Strategy<Value = ChangeOperation> {
    prop_oneof![
        Just(ChangeOperation::Create),
        Just(ChangeOperation::Update),
        Just(ChangeOperation::Delete),
    ]
}

proptest! {
    #[test]
    fn pending_records_preserve_insertion_order(
        mutations in prop::collection::vec((operation_strategy(), "[a-z0-9]{1,12}"), 0..40)
    ) {
        let log = open_log(Arc::new(MemoryKvStore::new()));
        let mut appended = Vec::new();
        for (operation, entity_id) in &mutations {
            let payload = match operation {
                ChangeOperation::Delete => serde_json::Value::Null,
                _ => json!({ "id": entity_id }),
            };
            let record = log
                .append(*operation, &EntityRef::new("todo", entity_id.clone()), payload)
                .unwrap();
            appended.push((record.id, entity_id.clone()));
        }

        let pending: Vec<(u64, String)> = log
            .pending_records()
            .into_iter()
            .map(|record| (record.id, record.entity_id))
            .collect();
        prop_assert_eq!(&pending, &appended);
        prop_assert!(pending.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }
}

#[test]
fn records_survive_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.db");
    let entity = EntityRef::new("todo", "t1");

    let first_ids = {
        let log = open_log(Arc::new(SqliteKvStore::open(&path).unwrap()));
        let a = log
            .append(ChangeOperation::Create, &entity, json!({"title": "a"}))
            .unwrap();
        let b = log
            .append_versioned(ChangeOperation::Update, &entity, json!({"title": "b"}), Some(0))
            .unwrap();
        log.mark_status(a.id, SyncStatus::Syncing).unwrap();
        vec![a.id, b.id]
    };

    let log = open_log(Arc::new(SqliteKvStore::open(&path).unwrap()));
    let records = log.records();
    assert_eq!(
        records.iter().map(|record| record.id).collect::<Vec<_>>(),
        first_ids
    );
    // In flight when the process stopped, so it is queued again.
    assert_eq!(records[0].sync_status, SyncStatus::Pending);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(log.pending_count(), 2);
    assert_eq!(records[1].base_version, Some(0));
    assert_eq!(records[1].payload, json!({"title": "b"}));

    let next = log
        .append(ChangeOperation::Delete, &entity, serde_json::Value::Null)
        .unwrap();
    assert_eq!(next.id, first_ids[1] + 1);
}

#[test]
fn appends_during_storage_outage_are_buffered_then_flushed() {
    let inner = Arc::new(MemoryKvStore::new());
    let log = open_log(inner.clone());
    let entity = EntityRef::new("todo", "t1");

    inner.set_available(false);
    let record = log
        .append(ChangeOperation::Create, &entity, json!({"title": "offline"}))
        .unwrap();
    assert_eq!(log.pending_count(), 1);
    assert!(log.buffered_count() > 0);
    assert!(matches!(log.flush(), Err(SyncError::Storage(_))));

    inner.set_available(true);
    assert!(log.flush().unwrap() > 0);
    assert_eq!(log.buffered_count(), 0);
    drop(log);

    let reopened = open_log(inner);
    assert_eq!(reopened.get(record.id).unwrap().payload, json!({"title": "offline"}));
}

#[test]
fn open_fails_when_storage_is_unreadable() {
    let inner = Arc::new(MemoryKvStore::new());
    inner.set_available(false);

    let result = ChangeLog::open(inner, "device-a", Arc::new(ManualClock::new(0)));
    assert!(matches!(result, Err(SyncError::Storage(_))));
}

#[test]
fn failed_records_stay_pending_for_retry() {
    let log = open_log(Arc::new(MemoryKvStore::new()));
    let entity = EntityRef::new("todo", "t1");
    let first = log
        .append(ChangeOperation::Create, &entity, json!({}))
        .unwrap();
    let second = log
        .append(ChangeOperation::Update, &entity, json!({}))
        .unwrap();

    {
        let session = log.begin_session().unwrap();
        session.mark_status(first.id, SyncStatus::Syncing).unwrap();
        session.mark_failed(first.id, "remote said no").unwrap();
        session.mark_status(second.id, SyncStatus::Syncing).unwrap();
        session.revert_to_pending(second.id).unwrap();
    }

    let pending = log.pending_records();
    assert_eq!(
        pending.iter().map(|record| record.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );
    assert_eq!(pending[0].sync_status, SyncStatus::Failed);
    assert_eq!(pending[0].last_error.as_deref(), Some("remote said no"));
    assert_eq!(pending[1].sync_status, SyncStatus::Pending);
}

#[test]
fn invalid_device_id_is_rejected() {
    let result = ChangeLog::open(
        Arc::new(MemoryKvStore::new()),
        "bad device/id",
        Arc::new(ManualClock::new(0)),
    );
    assert!(matches!(result, Err(SyncError::Validation(_))));
}
