use proptest::prelude::*;
use serde_json::{json, Value};
use todosync_core::{
    ChangeOperation, ChangeRecord, ConflictResolver, EntityRef, EntitySnapshot,
    FieldMergeResolver, LastWriteWins, Resolution, SyncStatus,
};

fn payload_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9 ]{0,12}", 0..5)
        .prop_map(|fields| json!(fields))
}

fn record(operation: ChangeOperation, payload: Value, timestamp: i64) -> ChangeRecord {
    ChangeRecord {
        id: 1,
        device_id: "device-a".to_string(),
        entity_type: "todo".to_string(),
        entity_id: "t1".to_string(),
        operation,
        payload,
        base_version: Some(1),
        timestamp,
        sync_status: SyncStatus::Syncing,
        attempts: 1,
        last_error: None,
    }
}

proptest! {
    #[test]
    fn last_write_wins_is_deterministic_on_timestamp_ties(
        timestamp in any::<i64>(),
        version in 1u64..1_000,
        local_payload in payload_strategy(),
        remote_payload in payload_strategy(),
    ) {
        let local = record(ChangeOperation::Update, local_payload, timestamp);
        let remote = EntitySnapshot::new(&EntityRef::new("todo", "t1"), version, remote_payload, timestamp);

        let first = LastWriteWins.resolve(&local, &remote).unwrap();
        let second = LastWriteWins.resolve(&local, &remote).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first, Resolution::TakeRemote);
    }

    #[test]
    fn field_merge_is_deterministic_and_keeps_every_key(
        timestamp in any::<i64>(),
        local_payload in payload_strategy(),
        remote_payload in payload_strategy(),
    ) {
        let local = record(ChangeOperation::Update, local_payload.clone(), timestamp);
        let remote = EntitySnapshot::new(&EntityRef::new("todo", "t1"), 2, remote_payload.clone(), timestamp);

        let first = FieldMergeResolver.resolve(&local, &remote).unwrap();
        prop_assert_eq!(&first, &FieldMergeResolver.resolve(&local, &remote).unwrap());

        let Resolution::Merge(merged) = first else {
            return Err(TestCaseError::fail("object payloads must merge"));
        };
        let merged = merged.as_object().unwrap();
        for (key, value) in local_payload.as_object().unwrap() {
            prop_assert_eq!(merged.get(key), Some(value));
        }
        for key in remote_payload.as_object().unwrap().keys() {
            prop_assert!(merged.contains_key(key));
        }
    }
}
