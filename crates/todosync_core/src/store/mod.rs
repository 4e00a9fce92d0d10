//! Host persistence boundary.
//!
//! # Responsibility
//! - Define the key-value contract the sync core persists through.
//! - Provide SQLite, in-memory and write-behind implementations.
//!
//! # Invariants
//! - `list_prefix` returns entries ordered by key.
//! - Values are opaque UTF-8 strings (JSON documents in practice).

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod buffered;
pub mod memory_store;
pub mod sqlite_store;

pub use buffered::BufferedKvStore;
pub use memory_store::MemoryKvStore;
pub use sqlite_store::SqliteKvStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence failure at the host storage boundary.
#[derive(Debug)]
pub enum StoreError {
    /// The medium cannot be reached right now; callers may retry.
    Unavailable(String),
    Db(DbError),
    /// A stored value could not be decoded.
    Corrupt { key: String, message: String },
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "storage unavailable: {message}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Corrupt { key, message } => {
                write!(f, "corrupt value at `{key}`: {message}")
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Unavailable(_) | Self::Corrupt { .. } => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Key-value contract required by the change log and local entity state.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;
    /// Returns all entries whose key starts with `prefix`, ordered by key.
    fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;
}

/// Smallest string greater than every key starting with `prefix`.
///
/// Returns `None` when no such bound exists (empty prefix or a prefix made
/// only of `char::MAX`).
pub(crate) fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        // Skip the surrogate gap, which has no `char` values.
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(bumped) = char::from_u32(next) {
            chars.push(bumped);
            return Some(chars.into_iter().collect());
        }
    }
    None
}
