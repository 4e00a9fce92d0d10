//! Change record model for the local change log.
//!
//! # Responsibility
//! - Define the record shape for one user mutation awaiting delivery.
//! - Own the delivery status lifecycle and its allowed transitions.
//! - Validate mutation input before it is accepted into the log.
//!
//! # Invariants
//! - `id` is monotonic per device and never reused.
//! - Status only moves forward: `pending -> syncing -> {synced | failed}`,
//!   `failed -> syncing` for retries. `syncing -> pending` is reserved for
//!   cancelled passes and must be requested explicitly.
//! - Create/update payloads are JSON objects.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

static ENTITY_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("valid entity type regex"));
static ENTITY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.:\-]{1,128}$").expect("valid entity id regex"));
static DEVICE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").expect("valid device id regex"));

/// Per-device monotonic change identifier.
pub type ChangeId = u64;

/// Kind of mutation captured by a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Delivery status of one change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Recorded locally, not yet sent.
    Pending,
    /// Part of the active sync session.
    Syncing,
    /// Acknowledged (or resolved) by the remote.
    Synced,
    /// Last delivery attempt failed; eligible for retry.
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Returns whether `self -> next` is a regular forward transition.
    ///
    /// The cancellation edge `syncing -> pending` is not included; it is
    /// only reachable through the change log's revert path.
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Syncing)
                | (Self::Syncing, Self::Synced)
                | (Self::Syncing, Self::Failed)
                | (Self::Failed, Self::Syncing)
        )
    }

    /// Records in these states still need to reach the remote.
    pub fn awaits_delivery(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

/// Reference to the entity a change applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Validates both halves for use as storage key segments.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !ENTITY_TYPE_RE.is_match(&self.entity_type) {
            return Err(ValidationError::InvalidEntityType(self.entity_type.clone()));
        }
        if !ENTITY_ID_RE.is_match(&self.entity_id) {
            return Err(ValidationError::InvalidEntityId(self.entity_id.clone()));
        }
        Ok(())
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// One user mutation recorded by the local change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub device_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: ChangeOperation,
    /// JSON object for create/update, usually `null` for delete.
    pub payload: Value,
    /// Entity version this mutation was made against. `None` for creates.
    pub base_version: Option<u64>,
    /// Unix epoch milliseconds at append time.
    pub timestamp: i64,
    pub sync_status: SyncStatus,
    /// Number of times this record entered `syncing`.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ChangeRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// Validation failures rejected before anything is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidEntityType(String),
    InvalidEntityId(String),
    InvalidDeviceId(String),
    /// Create/update payloads must be JSON objects.
    PayloadNotObject(ChangeOperation),
    InvalidTransition {
        id: ChangeId,
        from: SyncStatus,
        to: SyncStatus,
    },
    UnknownChange(ChangeId),
    UnknownEntity(EntityRef),
    EmptyTitle,
    TitleTooLong {
        max_chars: usize,
        actual_chars: usize,
    },
    InvalidPayload(String),
    InvalidConfig(String),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEntityType(value) => write!(f, "entity type is invalid: `{value}`"),
            Self::InvalidEntityId(value) => write!(f, "entity id is invalid: `{value}`"),
            Self::InvalidDeviceId(value) => write!(f, "device id is invalid: `{value}`"),
            Self::PayloadNotObject(operation) => write!(
                f,
                "{} payload must be a JSON object",
                operation.as_str()
            ),
            Self::InvalidTransition { id, from, to } => write!(
                f,
                "change {id} cannot move from {} to {}",
                from.as_str(),
                to.as_str()
            ),
            Self::UnknownChange(id) => write!(f, "change not found: {id}"),
            Self::UnknownEntity(entity) => write!(f, "entity not found: {entity}"),
            Self::EmptyTitle => write!(f, "title cannot be empty"),
            Self::TitleTooLong {
                max_chars,
                actual_chars,
            } => write!(
                f,
                "title has {actual_chars} characters; maximum is {max_chars}"
            ),
            Self::InvalidPayload(message) => write!(f, "invalid entity payload: {message}"),
            Self::InvalidConfig(message) => write!(f, "invalid sync config: {message}"),
        }
    }
}

impl Error for ValidationError {}

/// Validates a mutation before it is logged.
pub fn validate_mutation(
    operation: ChangeOperation,
    entity: &EntityRef,
    payload: &Value,
) -> Result<(), ValidationError> {
    entity.validate()?;
    match operation {
        ChangeOperation::Create | ChangeOperation::Update if !payload.is_object() => {
            Err(ValidationError::PayloadNotObject(operation))
        }
        _ => Ok(()),
    }
}

/// Validates a device identifier used in change records and storage keys.
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if DEVICE_ID_RE.is_match(device_id) {
        Ok(())
    } else {
        Err(ValidationError::InvalidDeviceId(device_id.to_string()))
    }
}
