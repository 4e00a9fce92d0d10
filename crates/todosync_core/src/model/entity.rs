//! Versioned entity snapshot shared by local state and the remote boundary.

use crate::model::change::EntityRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Materialized state of one entity at a given version.
///
/// Locally, `version` is the last remote version this device has seen for
/// the entity (`0` when the entity was created offline and never synced).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: String,
    pub entity_id: String,
    pub version: u64,
    pub payload: Value,
    /// Unix epoch milliseconds of the write that produced this version.
    pub updated_at: i64,
    /// Tombstone flag. Deleted entities keep their last payload.
    #[serde(default)]
    pub deleted: bool,
}

impl EntitySnapshot {
    pub fn new(entity: &EntityRef, version: u64, payload: Value, updated_at: i64) -> Self {
        Self {
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            version,
            payload,
            updated_at,
            deleted: false,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type.clone(), self.entity_id.clone())
    }

    pub fn is_active(&self) -> bool {
        !self.deleted
    }
}
