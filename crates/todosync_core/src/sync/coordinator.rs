//! Sync coordinator.
//!
//! # Responsibility
//! - Drain the change log against the remote when the network is online.
//! - Apply acknowledgments, conflicts and failures to local state.
//! - Schedule retries with exponential backoff.
//!
//! # Invariants
//! - State machine: `Idle -> Syncing -> {Idle | BackoffWait} -> Idle`.
//! - At most one pass runs at a time (change log session lock).
//! - Records appended during a pass wait for the next pass.
//! - A pass cancelled by a connectivity drop keeps acknowledged records
//!   `synced` and returns in-flight records to `pending`.
//! - Storage and transport failures never escape `poll`/`sync_now`; only
//!   resolver failures do.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::model::change::{ChangeId, ChangeOperation, ChangeRecord, SyncStatus};
use crate::model::entity::EntitySnapshot;
use crate::repo::entity_repo::EntityRepository;
use crate::sync::backoff::{Backoff, BackoffPolicy};
use crate::sync::change_log::{ChangeLog, SessionLock};
use crate::sync::network::{NetworkMonitor, NetworkState, Subscription};
use crate::sync::remote::{RecordOutcome, RemoteService, TransportError};
use crate::sync::resolver::{ConflictResolver, Resolution, ResolverError};
use crate::sync::session::{SessionOutcome, SessionSummary, SyncSession};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity at which an in-flight batch checks for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Syncing,
    BackoffWait { until_ms: i64 },
}

impl CoordinatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::BackoffWait { .. } => "backoff_wait",
        }
    }
}

/// Status snapshot for the UI boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusView {
    pub state: CoordinatorState,
    pub network: NetworkState,
    pub pending_count: usize,
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<i64>,
    /// Local writes still waiting for the storage medium.
    pub buffered_writes: usize,
}

impl SyncStatusView {
    /// One-line status such as `3 changes pending` or `offline`.
    pub fn summary(&self) -> String {
        if self.network != NetworkState::Online {
            return match self.pending_count {
                0 => self.network.as_str().to_string(),
                count => format!("{}, {}", self.network.as_str(), pending_label(count)),
            };
        }
        match self.state {
            CoordinatorState::Syncing => "syncing".to_string(),
            CoordinatorState::BackoffWait { .. } => {
                format!("retrying, {}", pending_label(self.pending_count))
            }
            CoordinatorState::Idle if self.pending_count == 0 => "up to date".to_string(),
            CoordinatorState::Idle => pending_label(self.pending_count),
        }
    }
}

fn pending_label(count: usize) -> String {
    if count == 1 {
        "1 change pending".to_string()
    } else {
        format!("{count} changes pending")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotOnline,
    NothingPending,
    BackingOff,
    /// Another pass holds the session lock.
    Busy,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotOnline => "not_online",
            Self::NothingPending => "nothing_pending",
            Self::BackingOff => "backing_off",
            Self::Busy => "busy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Skipped(SkipReason),
    Completed(SessionSummary),
    Failed {
        summary: SessionSummary,
        retry_at_ms: i64,
    },
    Cancelled(SessionSummary),
}

/// Flags flipped by the network listener. Never blocks.
#[derive(Debug, Default)]
struct Signals {
    wake: AtomicBool,
    cancel: AtomicBool,
}

#[derive(Debug)]
struct CoordinatorInner {
    state: CoordinatorState,
    backoff: Backoff,
    last_sync_at: Option<i64>,
    last_error: Option<String>,
}

enum DispatchError {
    Transport(TransportError),
    Cancelled,
}

pub struct SyncCoordinator {
    log: Arc<ChangeLog>,
    entities: Arc<dyn EntityRepository>,
    monitor: Arc<NetworkMonitor>,
    remote: Arc<dyn RemoteService>,
    resolver: Arc<dyn ConflictResolver>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    batch_timeout: Duration,
    signals: Arc<Signals>,
    subscription: Subscription,
    inner: Mutex<CoordinatorInner>,
}

impl SyncCoordinator {
    /// Builds a coordinator and subscribes it to `monitor`.
    ///
    /// The subscription is removed when the coordinator is dropped.
    pub fn new(
        config: &SyncConfig,
        log: Arc<ChangeLog>,
        entities: Arc<dyn EntityRepository>,
        monitor: Arc<NetworkMonitor>,
        remote: Arc<dyn RemoteService>,
        resolver: Arc<dyn ConflictResolver>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let signals = Arc::new(Signals::default());
        let listener_signals = Arc::clone(&signals);
        let subscription = monitor.on_change(move |transition| {
            if transition.to == NetworkState::Online {
                listener_signals.wake.store(true, Ordering::SeqCst);
            } else if transition.from == NetworkState::Online {
                listener_signals.cancel.store(true, Ordering::SeqCst);
            }
        });

        Ok(Self {
            log,
            entities,
            monitor,
            remote,
            resolver,
            clock,
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout(),
            signals,
            subscription,
            inner: Mutex::new(CoordinatorInner {
                state: CoordinatorState::Idle,
                backoff: Backoff::new(BackoffPolicy::from_config(config), config.jitter_seed),
                last_sync_at: None,
                last_error: None,
            }),
        })
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner().state
    }

    /// Whether connectivity returned since the last `poll`.
    pub fn wake_pending(&self) -> bool {
        self.signals.wake.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatusView {
        let inner = self.inner();
        let next_retry_at = match inner.state {
            CoordinatorState::BackoffWait { until_ms } => Some(until_ms),
            _ => None,
        };
        SyncStatusView {
            state: inner.state,
            network: self.monitor.current_state(),
            pending_count: self.log.pending_count(),
            last_sync_at: inner.last_sync_at,
            last_error: inner.last_error.clone(),
            next_retry_at,
            buffered_writes: self.log.buffered_count(),
        }
    }

    /// Drives the state machine once.
    ///
    /// Commits due network transitions, leaves `BackoffWait` when its
    /// deadline passed (or connectivity just returned) and runs a pass when
    /// the network is online and changes are pending.
    ///
    /// # Errors
    /// - `Resolver` when the conflict policy fails; the record is marked
    ///   failed and the coordinator returns to `Idle`.
    pub fn poll(&self) -> SyncResult<PassOutcome> {
        self.monitor.tick();
        let woke = self.signals.wake.swap(false, Ordering::SeqCst);
        let now = self.clock.now_ms();
        {
            let mut inner = self.inner();
            if let CoordinatorState::BackoffWait { until_ms } = inner.state {
                if now < until_ms && !woke {
                    return Ok(PassOutcome::Skipped(SkipReason::BackingOff));
                }
                inner.state = CoordinatorState::Idle;
                info!(
                    "event=sync_backoff module=sync status=elapsed woke={}",
                    woke
                );
            }
        }
        self.run_pass()
    }

    /// Runs a pass now, ignoring any backoff deadline.
    pub fn sync_now(&self) -> SyncResult<PassOutcome> {
        self.monitor.tick();
        self.signals.wake.store(false, Ordering::SeqCst);
        self.run_pass()
    }

    fn run_pass(&self) -> SyncResult<PassOutcome> {
        if self.monitor.current_state() != NetworkState::Online {
            return Ok(PassOutcome::Skipped(SkipReason::NotOnline));
        }
        if self.log.pending_count() == 0 {
            return Ok(PassOutcome::Skipped(SkipReason::NothingPending));
        }
        let Some(lock) = self.log.begin_session() else {
            return Ok(PassOutcome::Skipped(SkipReason::Busy));
        };

        // A drop reported after this point cancels the pass.
        self.signals.cancel.store(false, Ordering::SeqCst);
        if self.monitor.current_state() != NetworkState::Online {
            return Ok(PassOutcome::Skipped(SkipReason::NotOnline));
        }
        let records = lock.snapshot_pending();
        if records.is_empty() {
            return Ok(PassOutcome::Skipped(SkipReason::NothingPending));
        }

        let mut session = SyncSession::new(records, self.clock.now_ms());
        self.set_state(CoordinatorState::Syncing);
        info!(
            "event=sync_pass module=sync status=start session_id={} records={}",
            session.id(),
            session.records().len()
        );

        match self.drain(&lock, &mut session) {
            Ok(DrainEnd::Finished { failure }) => Ok(self.finish_pass(&session, failure)),
            Ok(DrainEnd::Cancelled { failure }) => {
                let summary = session.summary();
                let now = self.clock.now_ms();
                let mut inner = self.inner();
                if summary.synced + summary.resolved > 0 {
                    inner.last_sync_at = Some(now);
                }
                // Record-level failures from earlier chunks still back off.
                match failure {
                    Some(message) => {
                        schedule_retry(&mut inner, now, message);
                    }
                    None => inner.state = CoordinatorState::Idle,
                }
                drop(inner);
                warn!(
                    "event=sync_pass module=sync status=cancelled session_id={} synced={} failed={} reverted={}",
                    session.id(),
                    summary.synced,
                    summary.failed,
                    summary.reverted
                );
                Ok(PassOutcome::Cancelled(summary))
            }
            Err(err) => {
                let mut inner = self.inner();
                inner.state = CoordinatorState::Idle;
                inner.last_error = Some(err.to_string());
                error!(
                    "event=sync_pass module=sync status=error session_id={} error_code={}",
                    session.id(),
                    err.kind().code()
                );
                Err(err)
            }
        }
    }

    fn drain(&self, lock: &SessionLock<'_>, session: &mut SyncSession) -> SyncResult<DrainEnd> {
        let chunks: Vec<Vec<ChangeRecord>> = session
            .records()
            .chunks(self.batch_size)
            .map(<[ChangeRecord]>::to_vec)
            .collect();
        let mut failure: Option<String> = None;

        for chunk in chunks {
            self.monitor.tick();
            if self.signals.cancel.load(Ordering::SeqCst) {
                return Ok(DrainEnd::Cancelled { failure });
            }

            let mut in_flight = Vec::with_capacity(chunk.len());
            for record in &chunk {
                in_flight.push(lock.mark_status(record.id, SyncStatus::Syncing)?);
            }

            match self.dispatch(&in_flight) {
                Ok(outcomes) => {
                    if let Some(message) = self.apply_outcomes(lock, session, &in_flight, outcomes)? {
                        failure = Some(message);
                    }
                }
                Err(DispatchError::Cancelled) => {
                    for record in &in_flight {
                        lock.revert_to_pending(record.id)?;
                        session.record_outcome(record.id, SessionOutcome::Reverted);
                    }
                    return Ok(DrainEnd::Cancelled { failure });
                }
                Err(DispatchError::Transport(err)) => {
                    let message = err.to_string();
                    warn!(
                        "event=sync_batch module=sync status=error records={} error={}",
                        in_flight.len(),
                        message
                    );
                    for record in &in_flight {
                        lock.mark_failed(record.id, message.clone())?;
                        session.record_outcome(record.id, SessionOutcome::Failed(message.clone()));
                    }
                    return Ok(DrainEnd::Finished {
                        failure: Some(message),
                    });
                }
            }
        }
        Ok(DrainEnd::Finished { failure })
    }

    /// Sends one batch on a worker thread, bounded by the batch timeout and
    /// interrupted by cancellation.
    fn dispatch(&self, batch: &[ChangeRecord]) -> Result<Vec<RecordOutcome>, DispatchError> {
        let (sender, receiver) = mpsc::channel();
        let remote = Arc::clone(&self.remote);
        let owned = batch.to_vec();
        thread::Builder::new()
            .name("todosync-batch".to_string())
            .spawn(move || {
                let _ = sender.send(remote.push_batch(&owned));
            })
            .map_err(|err| {
                DispatchError::Transport(TransportError::Unreachable(format!(
                    "failed to start batch worker: {err}"
                )))
            })?;

        let deadline = Instant::now() + self.batch_timeout;
        loop {
            // Nobody else ticks the monitor while this thread waits.
            self.monitor.tick();
            if self.signals.cancel.load(Ordering::SeqCst) {
                return Err(DispatchError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DispatchError::Transport(TransportError::Timeout {
                    timeout_ms: u64::try_from(self.batch_timeout.as_millis()).unwrap_or(u64::MAX),
                }));
            }
            match receiver.recv_timeout(remaining.min(CANCEL_POLL_INTERVAL)) {
                Ok(result) => return result.map_err(DispatchError::Transport),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DispatchError::Transport(TransportError::Unreachable(
                        "batch worker exited without a result".to_string(),
                    )));
                }
            }
        }
    }

    /// Applies per-record outcomes. Returns the last record-level failure.
    fn apply_outcomes(
        &self,
        lock: &SessionLock<'_>,
        session: &mut SyncSession,
        batch: &[ChangeRecord],
        outcomes: Vec<RecordOutcome>,
    ) -> SyncResult<Option<String>> {
        let mut by_id: HashMap<ChangeId, RecordOutcome> = outcomes
            .into_iter()
            .map(|outcome| (outcome.change_id(), outcome))
            .collect();
        let mut failure = None;

        for (index, record) in batch.iter().enumerate() {
            let outcome = by_id.remove(&record.id).unwrap_or(RecordOutcome::Error {
                change_id: record.id,
                message: "remote returned no outcome for record".to_string(),
            });
            match outcome {
                RecordOutcome::Ack { version, .. } => {
                    lock.mark_status(record.id, SyncStatus::Synced)?;
                    self.note_remote_version(record, version);
                    session.record_outcome(record.id, SessionOutcome::Synced);
                }
                RecordOutcome::Conflict { remote, .. } => {
                    match self.resolve_conflict(lock, record, &remote) {
                        Ok(resolution) => {
                            session.record_outcome(record.id, SessionOutcome::Resolved(resolution));
                        }
                        Err(err) => {
                            lock.mark_failed(record.id, err.to_string())?;
                            session.record_outcome(record.id, SessionOutcome::Failed(err.to_string()));
                            for rest in &batch[index + 1..] {
                                lock.revert_to_pending(rest.id)?;
                                session.record_outcome(rest.id, SessionOutcome::Reverted);
                            }
                            return Err(err);
                        }
                    }
                }
                RecordOutcome::Error { message, .. } => {
                    lock.mark_failed(record.id, message.clone())?;
                    session.record_outcome(record.id, SessionOutcome::Failed(message.clone()));
                    failure = Some(message);
                }
            }
        }
        Ok(failure)
    }

    fn resolve_conflict(
        &self,
        lock: &SessionLock<'_>,
        record: &ChangeRecord,
        remote: &EntitySnapshot,
    ) -> SyncResult<&'static str> {
        let resolution = self.resolver.resolve(record, remote)?;
        let entity = record.entity_ref();
        match &resolution {
            Resolution::TakeRemote => {
                self.entities.put_entity(remote);
            }
            Resolution::TakeLocal => {
                let (operation, payload) = match record.operation {
                    ChangeOperation::Delete => (ChangeOperation::Delete, record.payload.clone()),
                    ChangeOperation::Create | ChangeOperation::Update => {
                        (ChangeOperation::Update, record.payload.clone())
                    }
                };
                self.log
                    .append_versioned(operation, &entity, payload, Some(remote.version))?;
                self.note_remote_version(record, remote.version);
            }
            Resolution::Merge(payload) => {
                if !payload.is_object() {
                    return Err(ResolverError::new(
                        self.resolver.name(),
                        "merged payload must be a JSON object",
                    )
                    .into());
                }
                self.log.append_versioned(
                    ChangeOperation::Update,
                    &entity,
                    payload.clone(),
                    Some(remote.version),
                )?;
                let merged =
                    EntitySnapshot::new(&entity, remote.version, payload.clone(), self.clock.now_ms());
                self.entities.put_entity(&merged);
            }
        }
        lock.mark_status(record.id, SyncStatus::Synced)?;
        info!(
            "event=sync_conflict module=sync status=ok change_id={} policy={} resolution={}",
            record.id,
            self.resolver.name(),
            resolution.as_str()
        );
        Ok(resolution.as_str())
    }

    /// Raises the locally known remote version of the record's entity.
    fn note_remote_version(&self, record: &ChangeRecord, version: u64) {
        match self.entities.get_entity(&record.entity_ref()) {
            Ok(Some(mut snapshot)) if snapshot.version < version => {
                snapshot.version = version;
                self.entities.put_entity(&snapshot);
            }
            Ok(_) => {}
            Err(err) => warn!(
                "event=entity_version module=sync status=error change_id={} error={}",
                record.id, err
            ),
        }
    }

    fn finish_pass(&self, session: &SyncSession, failure: Option<String>) -> PassOutcome {
        let summary = session.summary();
        let now = self.clock.now_ms();
        let mut inner = self.inner();
        if summary.synced + summary.resolved > 0 {
            inner.last_sync_at = Some(now);
        }

        match failure {
            Some(message) => {
                let (retry_at_ms, delay) = schedule_retry(&mut inner, now, message);
                warn!(
                    "event=sync_pass module=sync status=retry session_id={} failed={} delay_ms={} failures={}",
                    session.id(),
                    summary.failed,
                    delay,
                    inner.backoff.failures()
                );
                PassOutcome::Failed {
                    summary,
                    retry_at_ms,
                }
            }
            None => {
                inner.backoff.reset();
                inner.state = CoordinatorState::Idle;
                inner.last_error = None;
                info!(
                    "event=sync_pass module=sync status=ok session_id={} synced={} resolved={}",
                    session.id(),
                    summary.synced,
                    summary.resolved
                );
                PassOutcome::Completed(summary)
            }
        }
    }

    fn set_state(&self, state: CoordinatorState) {
        self.inner().state = state;
    }

    fn inner(&self) -> MutexGuard<'_, CoordinatorInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.monitor.unsubscribe(self.subscription);
    }
}

/// Enters `BackoffWait` for the next backoff delay and records `message`.
///
/// Returns the retry deadline and the delay used.
fn schedule_retry(inner: &mut CoordinatorInner, now: i64, message: String) -> (i64, u64) {
    let delay = inner.backoff.next_delay_ms();
    let retry_at_ms = now.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
    inner.state = CoordinatorState::BackoffWait {
        until_ms: retry_at_ms,
    };
    inner.last_error = Some(message);
    (retry_at_ms, delay)
}

enum DrainEnd {
    Finished { failure: Option<String> },
    Cancelled { failure: Option<String> },
}
