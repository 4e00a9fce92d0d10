//! Todo domain model.
//!
//! # Responsibility
//! - Define the productivity entity synchronized by this crate.
//! - Convert between typed todos and the JSON payloads carried by
//!   change records and entity snapshots.
//!
//! # Invariants
//! - `id` is stable and never reused for another todo.
//! - `title` is non-empty after trimming and at most `MAX_TITLE_CHARS`.

use crate::model::change::{EntityRef, ValidationError};
use crate::model::entity::EntitySnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Entity type segment used for todos in change records and storage keys.
pub const TODO_ENTITY_TYPE: &str = "todo";
pub const MAX_TITLE_CHARS: usize = 500;

pub type TodoId = Uuid;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Todo,
    InProgress,
    Done,
    Cancelled,
}

impl TodoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "todo" => Some(Self::Todo),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Done and cancelled todos are hidden from open lists.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Todo | Self::InProgress)
    }
}

/// A single todo item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: TodoId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: TodoStatus,
    /// Unix epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<i64>,
    /// Unix epoch milliseconds of the last local or remote write.
    pub updated_at: i64,
}

impl Todo {
    /// Creates an open todo with a generated id.
    pub fn new(title: impl Into<String>, updated_at: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            notes: None,
            status: TodoStatus::Todo,
            due_at: None,
            updated_at,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(TODO_ENTITY_TYPE, self.id.to_string())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let trimmed = self.title.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        let actual_chars = trimmed.chars().count();
        if actual_chars > MAX_TITLE_CHARS {
            return Err(ValidationError::TitleTooLong {
                max_chars: MAX_TITLE_CHARS,
                actual_chars,
            });
        }
        Ok(())
    }

    /// Serializes this todo into a change/snapshot payload object.
    pub fn to_payload(&self) -> Result<Value, ValidationError> {
        serde_json::to_value(self).map_err(|err| ValidationError::InvalidPayload(err.to_string()))
    }

    /// Decodes a todo from a snapshot payload.
    pub fn from_snapshot(snapshot: &EntitySnapshot) -> Result<Self, ValidationError> {
        if snapshot.entity_type != TODO_ENTITY_TYPE {
            return Err(ValidationError::InvalidEntityType(
                snapshot.entity_type.clone(),
            ));
        }
        let todo: Todo = serde_json::from_value(snapshot.payload.clone())
            .map_err(|err| ValidationError::InvalidPayload(err.to_string()))?;
        if todo.id.to_string() != snapshot.entity_id {
            return Err(ValidationError::InvalidPayload(format!(
                "payload id `{}` does not match entity id `{}`",
                todo.id, snapshot.entity_id
            )));
        }
        Ok(todo)
    }
}
