//! Offline-first synchronization.
//!
//! # Responsibility
//! - Record local mutations (`change_log`) and deliver them to a
//!   `RemoteService` when the `NetworkMonitor` reports connectivity.
//! - Settle diverging versions through a pluggable `ConflictResolver`.
//!
//! # Invariants
//! - The monitor is injected wherever it is needed; there is no global
//!   network state.
//! - Change records only move forward through their status lifecycle,
//!   except for in-flight records of a cancelled pass.

pub mod backoff;
pub mod change_log;
pub mod coordinator;
pub mod loopback;
pub mod network;
pub mod remote;
pub mod resolver;
pub mod session;

pub use change_log::{ChangeLog, SessionLock};
pub use coordinator::{CoordinatorState, PassOutcome, SkipReason, SyncCoordinator, SyncStatusView};
pub use loopback::LoopbackRemote;
pub use network::{NetworkMonitor, NetworkState, NetworkTransition, Subscription};
pub use remote::{RecordOutcome, RemoteService, TransportError};
pub use resolver::{ConflictResolver, FieldMergeResolver, LastWriteWins, Resolution, ResolverError};
pub use session::{SessionOutcome, SessionSummary, SyncSession};
