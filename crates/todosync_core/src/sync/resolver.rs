//! Conflict resolution policies.
//!
//! # Responsibility
//! - Decide what wins when a local change meets a diverging remote entity.
//!
//! # Invariants
//! - Policies are deterministic: identical inputs give identical results.
//! - Last-write-wins breaks timestamp ties toward the remote snapshot.

use crate::model::change::{ChangeOperation, ChangeRecord};
use crate::model::entity::EntitySnapshot;
use serde_json::Value;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Outcome chosen by a resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    TakeLocal,
    TakeRemote,
    /// Replace both sides with this payload.
    Merge(Value),
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakeLocal => "take_local",
            Self::TakeRemote => "take_remote",
            Self::Merge(_) => "merge",
        }
    }
}

/// Resolver failure. This is the one conflict-path error surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverError {
    pub policy: String,
    pub message: String,
}

impl ResolverError {
    pub fn new(policy: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            message: message.into(),
        }
    }
}

impl Display for ResolverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "resolver `{}` failed: {}", self.policy, self.message)
    }
}

impl Error for ResolverError {}

pub trait ConflictResolver: Send + Sync {
    /// Short policy name for logs and errors.
    fn name(&self) -> &str;

    fn resolve(
        &self,
        local: &ChangeRecord,
        remote: &EntitySnapshot,
    ) -> Result<Resolution, ResolverError>;
}

/// Newest timestamp wins; ties go to the remote.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn name(&self) -> &str {
        "last_write_wins"
    }

    fn resolve(
        &self,
        local: &ChangeRecord,
        remote: &EntitySnapshot,
    ) -> Result<Resolution, ResolverError> {
        Ok(last_write_wins(local, remote))
    }
}

/// Shallow JSON-object merge where local keys overwrite remote keys.
///
/// Deletes on either side and non-object payloads fall back to
/// last-write-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMergeResolver;

impl ConflictResolver for FieldMergeResolver {
    fn name(&self) -> &str {
        "field_merge"
    }

    fn resolve(
        &self,
        local: &ChangeRecord,
        remote: &EntitySnapshot,
    ) -> Result<Resolution, ResolverError> {
        if local.operation == ChangeOperation::Delete || remote.deleted {
            return Ok(last_write_wins(local, remote));
        }
        match (&remote.payload, &local.payload) {
            (Value::Object(remote_map), Value::Object(local_map)) => {
                let mut merged = remote_map.clone();
                for (key, value) in local_map {
                    merged.insert(key.clone(), value.clone());
                }
                Ok(Resolution::Merge(Value::Object(merged)))
            }
            _ => Ok(last_write_wins(local, remote)),
        }
    }
}

fn last_write_wins(local: &ChangeRecord, remote: &EntitySnapshot) -> Resolution {
    match local.timestamp.cmp(&remote.updated_at) {
        Ordering::Greater => Resolution::TakeLocal,
        Ordering::Less | Ordering::Equal => Resolution::TakeRemote,
    }
}
