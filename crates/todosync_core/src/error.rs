//! Crate-level error taxonomy.
//!
//! # Responsibility
//! - Tag every failure with an `ErrorKind` carrying a status-code
//!   equivalent, so hosts can map errors without matching on variants.
//!
//! # Invariants
//! - Storage and transport errors are absorbed by the change log and the
//!   coordinator; callers only see validation and resolver failures from
//!   mutation/sync entry points.

use crate::model::change::{EntityRef, ValidationError};
use crate::store::StoreError;
use crate::sync::remote::TransportError;
use crate::sync::resolver::ResolverError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SyncResult<T> = Result<T, SyncError>;

/// Error category with a stable code and HTTP-like status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Storage,
    Transport,
    Conflict,
    Resolver,
}

impl ErrorKind {
    pub fn status_code(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Conflict => 409,
            Self::Resolver => 500,
            Self::Transport => 502,
            Self::Storage => 503,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Storage => "storage_error",
            Self::Transport => "transport_error",
            Self::Conflict => "conflict_error",
            Self::Resolver => "resolver_error",
        }
    }

    /// Whether the engine retries this kind on its own.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Storage | Self::Transport)
    }
}

#[derive(Debug)]
pub enum SyncError {
    Validation(ValidationError),
    Storage(StoreError),
    Transport(TransportError),
    /// Diverging versions; normally resolved before reaching a caller.
    Conflict(EntityRef),
    Resolver(ResolverError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Resolver(_) => ErrorKind::Resolver,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "{err}"),
            Self::Transport(err) => write!(f, "{err}"),
            Self::Conflict(entity) => write!(f, "conflicting versions for {entity}"),
            Self::Resolver(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::Transport(err) => Some(err),
            Self::Conflict(_) => None,
            Self::Resolver(err) => Some(err),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        Self::Storage(value)
    }
}

impl From<TransportError> for SyncError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<ResolverError> for SyncError {
    fn from(value: ResolverError) -> Self {
        Self::Resolver(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, SyncError};
    use crate::model::change::ValidationError;
    use crate::store::StoreError;
    use crate::sync::remote::TransportError;

    #[test]
    fn kinds_map_to_status_codes() {
        let validation: SyncError = ValidationError::EmptyTitle.into();
        assert_eq!(validation.kind(), ErrorKind::Validation);
        assert_eq!(validation.status_code(), 400);

        let transport: SyncError = TransportError::Timeout { timeout_ms: 10 }.into();
        assert_eq!(transport.status_code(), 502);
        assert!(transport.kind().is_retryable());

        let storage: SyncError = StoreError::Unavailable("disk".to_string()).into();
        assert_eq!(storage.kind().code(), "storage_error");
        assert_eq!(storage.status_code(), 503);
    }
}
