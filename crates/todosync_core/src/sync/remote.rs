//! Remote service boundary.
//!
//! The wire shape belongs to whoever implements `RemoteService`; the core
//! only needs ordered batch delivery with one outcome per record.

use crate::model::change::{ChangeId, ChangeRecord};
use crate::model::entity::EntitySnapshot;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Batch-level delivery failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Remote could not be reached at all.
    Unreachable(String),
    /// No response within the per-batch timeout.
    Timeout { timeout_ms: u64 },
    /// Remote answered but refused the whole batch.
    Rejected(String),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(message) => write!(f, "remote unreachable: {message}"),
            Self::Timeout { timeout_ms } => {
                write!(f, "batch timed out after {timeout_ms} ms")
            }
            Self::Rejected(message) => write!(f, "batch rejected: {message}"),
        }
    }
}

impl Error for TransportError {}

/// Per-record result of one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Applied (or already applied); `version` is the entity's remote version.
    Ack { change_id: ChangeId, version: u64 },
    /// Remote holds a diverging version of the entity.
    Conflict {
        change_id: ChangeId,
        remote: EntitySnapshot,
    },
    /// Record-level delivery failure; the record is retried later.
    Error { change_id: ChangeId, message: String },
}

impl RecordOutcome {
    pub fn change_id(&self) -> ChangeId {
        match self {
            Self::Ack { change_id, .. }
            | Self::Conflict { change_id, .. }
            | Self::Error { change_id, .. } => *change_id,
        }
    }
}

/// Batch synchronization endpoint.
///
/// Implementations must treat a record they have already applied as an
/// acknowledged no-op, since a lost acknowledgment leads to a resend.
pub trait RemoteService: Send + Sync {
    fn push_batch(&self, batch: &[ChangeRecord]) -> Result<Vec<RecordOutcome>, TransportError>;
}
