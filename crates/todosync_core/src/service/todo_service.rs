//! Todo use-case service.
//!
//! # Responsibility
//! - Validate todo mutations, update local state and log the matching
//!   change record for sync.
//!
//! # Invariants
//! - A mutation that fails validation touches neither local state nor the
//!   change log.
//! - Updates and deletes carry the last remote version seen for the todo as
//!   `base_version`.

use crate::clock::Clock;
use crate::error::SyncResult;
use crate::model::change::{ChangeOperation, EntityRef, ValidationError};
use crate::model::entity::EntitySnapshot;
use crate::model::todo::{Todo, TodoId, TodoStatus, TODO_ENTITY_TYPE};
use crate::repo::entity_repo::EntityRepository;
use crate::sync::change_log::ChangeLog;
use log::warn;
use serde_json::Value;
use std::sync::Arc;

/// Partial update. `None` leaves a field unchanged; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoPatch {
    pub title: Option<String>,
    pub notes: Option<Option<String>>,
    pub due_at: Option<Option<i64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TodoListQuery {
    pub status: Option<TodoStatus>,
    /// Include `done` and `cancelled` todos when no status filter is set.
    pub include_closed: bool,
}

pub struct TodoService {
    log: Arc<ChangeLog>,
    entities: Arc<dyn EntityRepository>,
    clock: Arc<dyn Clock>,
}

impl TodoService {
    pub fn new(
        log: Arc<ChangeLog>,
        entities: Arc<dyn EntityRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            log,
            entities,
            clock,
        }
    }

    pub fn create_todo(
        &self,
        title: impl Into<String>,
        notes: Option<String>,
        due_at: Option<i64>,
    ) -> SyncResult<Todo> {
        let mut todo = Todo::new(title, self.clock.now_ms());
        todo.title = todo.title.trim().to_string();
        todo.notes = notes;
        todo.due_at = due_at;
        todo.validate()?;

        let payload = todo.to_payload()?;
        let entity = todo.entity_ref();
        self.log
            .append(ChangeOperation::Create, &entity, payload.clone())?;
        self.entities
            .put_entity(&EntitySnapshot::new(&entity, 0, payload, todo.updated_at));
        Ok(todo)
    }

    /// # Errors
    /// - `Validation(UnknownEntity)` when the todo does not exist or is deleted.
    pub fn update_todo(&self, id: TodoId, patch: &TodoPatch) -> SyncResult<Todo> {
        let (snapshot, mut todo) = self.load_active(id)?;
        if let Some(title) = &patch.title {
            todo.title = title.trim().to_string();
        }
        if let Some(notes) = &patch.notes {
            todo.notes = notes.clone();
        }
        if let Some(due_at) = patch.due_at {
            todo.due_at = due_at;
        }
        self.write_update(snapshot, todo)
    }

    pub fn set_status(&self, id: TodoId, status: TodoStatus) -> SyncResult<Todo> {
        let (snapshot, mut todo) = self.load_active(id)?;
        todo.status = status;
        self.write_update(snapshot, todo)
    }

    /// Deletes a todo. Local state keeps a tombstone until sync settles it.
    pub fn delete_todo(&self, id: TodoId) -> SyncResult<()> {
        let (snapshot, _) = self.load_active(id)?;
        let entity = snapshot.entity_ref();
        self.log.append_versioned(
            ChangeOperation::Delete,
            &entity,
            Value::Null,
            Some(snapshot.version),
        )?;
        self.entities.put_entity(&EntitySnapshot {
            deleted: true,
            updated_at: self.clock.now_ms(),
            ..snapshot
        });
        Ok(())
    }

    pub fn get_todo(&self, id: TodoId) -> SyncResult<Option<Todo>> {
        match self.entities.get_entity(&todo_ref(id))? {
            Some(snapshot) if snapshot.is_active() => Ok(Some(Todo::from_snapshot(&snapshot)?)),
            _ => Ok(None),
        }
    }

    /// Active todos, most recently updated first.
    ///
    /// Snapshots that fail to decode are skipped with a warning.
    pub fn list_todos(&self, query: &TodoListQuery) -> SyncResult<Vec<Todo>> {
        let mut todos: Vec<Todo> = self
            .entities
            .list_entities(TODO_ENTITY_TYPE)?
            .iter()
            .filter(|snapshot| snapshot.is_active())
            .filter_map(|snapshot| match Todo::from_snapshot(snapshot) {
                Ok(todo) => Some(todo),
                Err(err) => {
                    warn!(
                        "event=todo_decode module=service status=error entity_id={} error={}",
                        snapshot.entity_id, err
                    );
                    None
                }
            })
            .filter(|todo| match query.status {
                Some(status) => todo.status == status,
                None => query.include_closed || todo.status.is_open(),
            })
            .collect();
        todos.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(todos)
    }

    fn load_active(&self, id: TodoId) -> SyncResult<(EntitySnapshot, Todo)> {
        let entity = todo_ref(id);
        match self.entities.get_entity(&entity)? {
            Some(snapshot) if snapshot.is_active() => {
                let todo = Todo::from_snapshot(&snapshot)?;
                Ok((snapshot, todo))
            }
            _ => Err(ValidationError::UnknownEntity(entity).into()),
        }
    }

    fn write_update(&self, snapshot: EntitySnapshot, mut todo: Todo) -> SyncResult<Todo> {
        todo.updated_at = self.clock.now_ms();
        todo.validate()?;
        let payload = todo.to_payload()?;
        let entity = snapshot.entity_ref();
        self.log.append_versioned(
            ChangeOperation::Update,
            &entity,
            payload.clone(),
            Some(snapshot.version),
        )?;
        self.entities.put_entity(&EntitySnapshot::new(
            &entity,
            snapshot.version,
            payload,
            todo.updated_at,
        ));
        Ok(todo)
    }
}

fn todo_ref(id: TodoId) -> EntityRef {
    EntityRef::new(TODO_ENTITY_TYPE, id.to_string())
}

#[cfg(test)]
mod tests {
    use super::{TodoListQuery, TodoPatch, TodoService};
    use crate::clock::ManualClock;
    use crate::error::SyncError;
    use crate::model::change::{ChangeOperation, ValidationError};
    use crate::model::todo::TodoStatus;
    use crate::repo::entity_repo::KvEntityRepository;
    use crate::store::MemoryKvStore;
    use crate::sync::change_log::ChangeLog;
    use std::sync::Arc;

    fn service() -> (Arc<ManualClock>, Arc<ChangeLog>, TodoService) {
        let store = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let log = Arc::new(
            ChangeLog::open(store.clone(), "device-a", clock.clone()).expect("open log"),
        );
        let entities = Arc::new(KvEntityRepository::new(store));
        let service = TodoService::new(log.clone(), entities, clock.clone());
        (clock, log, service)
    }

    #[test]
    fn blank_title_is_rejected_before_logging() {
        let (_clock, log, service) = service();
        let err = service
            .create_todo("   ", None, None)
            .expect_err("blank title must fail");
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::EmptyTitle)
        ));
        assert_eq!(log.pending_count(), 0);
    }

    #[test]
    fn patch_clears_and_sets_fields() {
        let (clock, log, service) = service();
        let todo = service
            .create_todo("write docs", Some("draft".to_string()), Some(5))
            .expect("create");
        clock.advance_ms(10);

        let patch = TodoPatch {
            title: Some(" publish docs ".to_string()),
            notes: Some(None),
            due_at: None,
        };
        let updated = service.update_todo(todo.id, &patch).expect("update");
        assert_eq!(updated.title, "publish docs");
        assert_eq!(updated.notes, None);
        assert_eq!(updated.due_at, Some(5));
        assert_eq!(updated.updated_at, 1_010);

        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].operation, ChangeOperation::Update);
        assert_eq!(records[1].base_version, Some(0));
    }

    #[test]
    fn deleted_todo_is_hidden_and_immutable() {
        let (_clock, _log, service) = service();
        let todo = service.create_todo("temp", None, None).expect("create");
        service.delete_todo(todo.id).expect("delete");

        assert!(service.get_todo(todo.id).expect("get").is_none());
        let err = service
            .set_status(todo.id, TodoStatus::Done)
            .expect_err("deleted todo cannot change");
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::UnknownEntity(_))
        ));
    }

    #[test]
    fn list_filters_closed_todos_by_default() {
        let (clock, _log, service) = service();
        let open = service.create_todo("open", None, None).expect("create");
        clock.advance_ms(1);
        let done = service.create_todo("done", None, None).expect("create");
        clock.advance_ms(1);
        service
            .set_status(done.id, TodoStatus::Done)
            .expect("complete");

        let default = service
            .list_todos(&TodoListQuery::default())
            .expect("list");
        assert_eq!(default.iter().map(|t| t.id).collect::<Vec<_>>(), vec![open.id]);

        let all = service
            .list_todos(&TodoListQuery {
                status: None,
                include_closed: true,
            })
            .expect("list all");
        assert_eq!(all.iter().map(|t| t.id).collect::<Vec<_>>(), vec![done.id, open.id]);

        let only_done = service
            .list_todos(&TodoListQuery {
                status: Some(TodoStatus::Done),
                include_closed: false,
            })
            .expect("list done");
        assert_eq!(only_done.len(), 1);
    }
}
