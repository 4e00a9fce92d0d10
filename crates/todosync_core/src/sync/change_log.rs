//! Local change log.
//!
//! # Responsibility
//! - Record user mutations in append order with per-device monotonic ids.
//! - Persist records through the host key-value store, surviving restarts.
//! - Guard status transitions and expose the session lock used by sync.
//!
//! # Invariants
//! - `append` never loses a validated mutation: storage failures are
//!   buffered in memory and flushed later.
//! - Ids are never reused, including after `compact_synced`.
//! - Status transitions follow `SyncStatus::can_transition_to`; the only
//!   backward edge (`syncing -> pending`) goes through `SessionLock`.
//! - At most one `SessionLock` exists at a time.
//! - `open` returns records left `syncing` by an interrupted process to
//!   `pending`, so no mutation is stranded in flight.

use crate::clock::Clock;
use crate::error::SyncResult;
use crate::model::change::{
    validate_device_id, validate_mutation, ChangeId, ChangeOperation, ChangeRecord, EntityRef,
    SyncStatus, ValidationError,
};
use crate::store::{BufferedKvStore, KvStore, StoreError};
use log::{error, info, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

const RECORD_PREFIX: &str = "changelog/record/";
const NEXT_ID_KEY: &str = "changelog/meta/next_id";

struct LogState {
    next_id: ChangeId,
    records: BTreeMap<ChangeId, ChangeRecord>,
}

pub struct ChangeLog {
    store: BufferedKvStore,
    clock: Arc<dyn Clock>,
    device_id: String,
    state: Mutex<LogState>,
    session_gate: Mutex<()>,
}

impl ChangeLog {
    /// Loads persisted records and resumes the id sequence.
    ///
    /// # Errors
    /// - `Validation` when `device_id` is not a valid identifier.
    /// - `Storage` when persisted records cannot be read or decoded.
    pub fn open(
        store: Arc<dyn KvStore>,
        device_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let device_id = device_id.into();
        validate_device_id(&device_id)?;

        let mut records = BTreeMap::new();
        for (key, value) in store.list_prefix(RECORD_PREFIX)? {
            let record: ChangeRecord =
                serde_json::from_str(&value).map_err(|err| StoreError::Corrupt {
                    key: key.clone(),
                    message: err.to_string(),
                })?;
            records.insert(record.id, record);
        }

        let stored_next = match store.get(NEXT_ID_KEY)? {
            Some(raw) => raw.parse::<ChangeId>().map_err(|err| StoreError::Corrupt {
                key: NEXT_ID_KEY.to_string(),
                message: err.to_string(),
            })?,
            None => 1,
        };
        let after_last = records.keys().next_back().map_or(1, |id| id + 1);
        let next_id = stored_next.max(after_last).max(1);

        let log = Self {
            store: BufferedKvStore::new(store),
            clock,
            device_id,
            state: Mutex::new(LogState { next_id, records }),
            session_gate: Mutex::new(()),
        };
        let recovered = log.recover_in_flight();

        info!(
            "event=changelog_open module=sync status=ok records={} next_id={} recovered={}",
            log.state().records.len(),
            next_id,
            recovered
        );
        Ok(log)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Appends a mutation with no base version (creates, blind writes).
    pub fn append(
        &self,
        operation: ChangeOperation,
        entity: &EntityRef,
        payload: Value,
    ) -> SyncResult<ChangeRecord> {
        self.append_versioned(operation, entity, payload, None)
    }

    /// Appends a mutation made against `base_version` of the entity.
    ///
    /// # Errors
    /// - `Validation` for malformed input; nothing is recorded.
    pub fn append_versioned(
        &self,
        operation: ChangeOperation,
        entity: &EntityRef,
        payload: Value,
        base_version: Option<u64>,
    ) -> SyncResult<ChangeRecord> {
        validate_mutation(operation, entity, &payload)?;

        let mut state = self.state();
        let record = ChangeRecord {
            id: state.next_id,
            device_id: self.device_id.clone(),
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            operation,
            payload,
            base_version,
            timestamp: self.clock.now_ms(),
            sync_status: SyncStatus::Pending,
            attempts: 0,
            last_error: None,
        };
        state.next_id += 1;
        state.records.insert(record.id, record.clone());
        self.persist(&record);
        self.store.put(NEXT_ID_KEY, &state.next_id.to_string());
        drop(state);

        info!(
            "event=change_append module=sync status=ok change_id={} operation={} entity_type={}",
            record.id,
            operation.as_str(),
            record.entity_type
        );
        Ok(record)
    }

    /// Records awaiting delivery (`pending` or `failed`), oldest first.
    pub fn pending_records(&self) -> Vec<ChangeRecord> {
        self.state()
            .records
            .values()
            .filter(|record| record.sync_status.awaits_delivery())
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state()
            .records
            .values()
            .filter(|record| record.sync_status.awaits_delivery())
            .count()
    }

    /// Every retained record, oldest first.
    pub fn records(&self) -> Vec<ChangeRecord> {
        self.state().records.values().cloned().collect()
    }

    pub fn get(&self, id: ChangeId) -> Option<ChangeRecord> {
        self.state().records.get(&id).cloned()
    }

    /// Applies a forward status transition.
    ///
    /// Waits for an active sync session to finish first.
    pub fn mark_status(&self, id: ChangeId, status: SyncStatus) -> SyncResult<ChangeRecord> {
        let _gate = self
            .session_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.transition(id, status, None)
    }

    /// Takes the session lock, or `None` when another session holds it.
    pub fn begin_session(&self) -> Option<SessionLock<'_>> {
        let guard = match self.session_gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(SessionLock {
            log: self,
            _guard: guard,
        })
    }

    /// Drops delivered records from memory and storage.
    ///
    /// Returns the number of records removed.
    pub fn compact_synced(&self) -> usize {
        let mut state = self.state();
        let synced: Vec<ChangeId> = state
            .records
            .values()
            .filter(|record| record.sync_status == SyncStatus::Synced)
            .map(|record| record.id)
            .collect();
        for id in &synced {
            state.records.remove(id);
            self.store.remove(&record_key(*id));
        }
        if !synced.is_empty() {
            info!(
                "event=changelog_compact module=sync status=ok removed={}",
                synced.len()
            );
        }
        synced.len()
    }

    /// Retries buffered writes. Returns how many reached storage.
    pub fn flush(&self) -> SyncResult<usize> {
        Ok(self.store.flush()?)
    }

    /// Writes still waiting for the storage medium.
    pub fn buffered_count(&self) -> usize {
        self.store.buffered_len()
    }

    fn transition(
        &self,
        id: ChangeId,
        status: SyncStatus,
        failure: Option<String>,
    ) -> SyncResult<ChangeRecord> {
        let mut state = self.state();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(ValidationError::UnknownChange(id))?;
        if !record.sync_status.can_transition_to(status) {
            return Err(ValidationError::InvalidTransition {
                id,
                from: record.sync_status,
                to: status,
            }
            .into());
        }
        apply_status(record, status, failure);
        let updated = record.clone();
        self.persist(&updated);
        Ok(updated)
    }

    fn revert(&self, id: ChangeId) -> SyncResult<ChangeRecord> {
        let mut state = self.state();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(ValidationError::UnknownChange(id))?;
        if record.sync_status != SyncStatus::Syncing {
            return Err(ValidationError::InvalidTransition {
                id,
                from: record.sync_status,
                to: SyncStatus::Pending,
            }
            .into());
        }
        record.sync_status = SyncStatus::Pending;
        let updated = record.clone();
        self.persist(&updated);
        Ok(updated)
    }

    /// Moves records stranded in `syncing` back to `pending`.
    fn recover_in_flight(&self) -> usize {
        let mut state = self.state();
        let mut recovered = 0;
        for record in state.records.values_mut() {
            if record.sync_status == SyncStatus::Syncing {
                record.sync_status = SyncStatus::Pending;
                self.persist(record);
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(
                "event=changelog_recover module=sync status=ok reverted={}",
                recovered
            );
        }
        recovered
    }

    fn persist(&self, record: &ChangeRecord) {
        match serde_json::to_string(record) {
            Ok(json) => self.store.put(&record_key(record.id), &json),
            Err(err) => error!(
                "event=change_persist module=sync status=error change_id={} error={}",
                record.id, err
            ),
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive access to record status during one sync pass.
///
/// Dropping the lock ends the session.
pub struct SessionLock<'a> {
    log: &'a ChangeLog,
    _guard: MutexGuard<'a, ()>,
}

impl SessionLock<'_> {
    /// Records awaiting delivery at this instant, oldest first.
    pub fn snapshot_pending(&self) -> Vec<ChangeRecord> {
        self.log.pending_records()
    }

    pub fn mark_status(&self, id: ChangeId, status: SyncStatus) -> SyncResult<ChangeRecord> {
        self.log.transition(id, status, None)
    }

    /// Moves a syncing record to `failed`, keeping the reason.
    pub fn mark_failed(&self, id: ChangeId, reason: impl Into<String>) -> SyncResult<ChangeRecord> {
        self.log
            .transition(id, SyncStatus::Failed, Some(reason.into()))
    }

    /// Returns an in-flight record to `pending` after a cancelled pass.
    pub fn revert_to_pending(&self, id: ChangeId) -> SyncResult<ChangeRecord> {
        let record = self.log.revert(id)?;
        warn!(
            "event=change_revert module=sync status=ok change_id={}",
            record.id
        );
        Ok(record)
    }

    pub fn log(&self) -> &ChangeLog {
        self.log
    }
}

fn apply_status(record: &mut ChangeRecord, status: SyncStatus, failure: Option<String>) {
    match status {
        SyncStatus::Syncing => record.attempts = record.attempts.saturating_add(1),
        SyncStatus::Synced => record.last_error = None,
        SyncStatus::Failed => record.last_error = failure,
        SyncStatus::Pending => {}
    }
    record.sync_status = status;
}

fn record_key(id: ChangeId) -> String {
    format!("{RECORD_PREFIX}{id:020}")
}

#[cfg(test)]
mod tests {
    use super::{record_key, ChangeLog};
    use crate::clock::ManualClock;
    use crate::error::SyncError;
    use crate::model::change::{ChangeOperation, EntityRef, SyncStatus, ValidationError};
    use crate::store::MemoryKvStore;
    use serde_json::json;
    use std::sync::Arc;

    fn open_log(store: Arc<MemoryKvStore>) -> ChangeLog {
        ChangeLog::open(store, "device-a", Arc::new(ManualClock::new(10)))
            .expect("change log should open")
    }

    #[test]
    fn record_keys_sort_numerically() {
        assert!(record_key(9) < record_key(10));
        assert!(record_key(99) < record_key(100));
    }

    #[test]
    fn invalid_mutation_is_not_logged() {
        let log = open_log(Arc::new(MemoryKvStore::new()));
        let err = log
            .append(
                ChangeOperation::Update,
                &EntityRef::new("todo", "t1"),
                json!([1, 2]),
            )
            .expect_err("array payload must be rejected");
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::PayloadNotObject(_))
        ));
        assert!(log.records().is_empty());
    }

    #[test]
    fn failed_record_cannot_return_to_pending() {
        let log = open_log(Arc::new(MemoryKvStore::new()));
        let record = log
            .append(
                ChangeOperation::Create,
                &EntityRef::new("todo", "t1"),
                json!({}),
            )
            .expect("append");
        log.mark_status(record.id, SyncStatus::Syncing)
            .expect("pending -> syncing");
        log.mark_status(record.id, SyncStatus::Failed)
            .expect("syncing -> failed");

        let err = log
            .mark_status(record.id, SyncStatus::Pending)
            .expect_err("failed -> pending must be rejected");
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::InvalidTransition { .. })
        ));

        let retried = log
            .mark_status(record.id, SyncStatus::Syncing)
            .expect("failed -> syncing is a retry");
        assert_eq!(retried.attempts, 2);
    }

    #[test]
    fn only_one_session_at_a_time() {
        let log = open_log(Arc::new(MemoryKvStore::new()));
        let first = log.begin_session().expect("first session");
        assert!(log.begin_session().is_none());
        drop(first);
        assert!(log.begin_session().is_some());
    }

    #[test]
    fn reopen_returns_in_flight_records_to_pending() {
        let store = Arc::new(MemoryKvStore::new());
        let log = open_log(store.clone());
        let record = log
            .append(
                ChangeOperation::Create,
                &EntityRef::new("todo", "t1"),
                json!({}),
            )
            .expect("append");
        let session = log.begin_session().expect("session");
        session
            .mark_status(record.id, SyncStatus::Syncing)
            .expect("pending -> syncing");
        // Process dies mid-pass: the lock is never released normally.
        std::mem::forget(session);

        let reopened = open_log(store.clone());
        let recovered = reopened.get(record.id).expect("record kept");
        assert_eq!(recovered.sync_status, SyncStatus::Pending);
        assert_eq!(recovered.attempts, 1);
        assert_eq!(reopened.pending_count(), 1);

        let persisted = open_log(store);
        assert_eq!(
            persisted.get(record.id).expect("record kept").sync_status,
            SyncStatus::Pending
        );
    }

    #[test]
    fn compaction_keeps_id_sequence() {
        let store = Arc::new(MemoryKvStore::new());
        let log = open_log(store.clone());
        let entity = EntityRef::new("todo", "t1");
        let record = log
            .append(ChangeOperation::Create, &entity, json!({}))
            .expect("append");
        log.mark_status(record.id, SyncStatus::Syncing).expect("syncing");
        log.mark_status(record.id, SyncStatus::Synced).expect("synced");
        assert_eq!(log.compact_synced(), 1);
        drop(log);

        let reopened = open_log(store);
        assert!(reopened.records().is_empty());
        let next = reopened
            .append(ChangeOperation::Update, &entity, json!({}))
            .expect("append after reopen");
        assert_eq!(next.id, record.id + 1);
    }
}
