//! Core of the todosync offline-first engine.
//! This crate owns the change log, sync state machine and todo invariants.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use logging::{init_logging, logging_status, LogLevel, LoggingError};
pub use model::change::{
    ChangeId, ChangeOperation, ChangeRecord, EntityRef, SyncStatus, ValidationError,
};
pub use model::entity::EntitySnapshot;
pub use model::todo::{Todo, TodoId, TodoStatus};
pub use repo::{EntityRepository, KvEntityRepository};
pub use service::{TodoListQuery, TodoPatch, TodoService};
pub use store::{BufferedKvStore, KvStore, MemoryKvStore, SqliteKvStore, StoreError};
pub use sync::{
    ChangeLog, ConflictResolver, CoordinatorState, FieldMergeResolver, LastWriteWins,
    LoopbackRemote, NetworkMonitor, NetworkState, PassOutcome, RecordOutcome, RemoteService,
    Resolution, ResolverError, SkipReason, SyncCoordinator, SyncStatusView, TransportError,
};

/// Minimal health-check API for host integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
