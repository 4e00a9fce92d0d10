//! Engine wiring.
//!
//! `SyncEngine` owns one change log, local entity state, network monitor and
//! coordinator over a single host store, so hosts deal with one handle.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::repo::entity_repo::KvEntityRepository;
use crate::service::todo_service::TodoService;
use crate::store::KvStore;
use crate::sync::change_log::ChangeLog;
use crate::sync::coordinator::{PassOutcome, SyncCoordinator, SyncStatusView};
use crate::sync::network::{NetworkMonitor, NetworkState, NetworkTransition};
use crate::sync::remote::RemoteService;
use crate::sync::resolver::{ConflictResolver, LastWriteWins};
use log::{info, warn};
use std::sync::Arc;

pub struct SyncEngineBuilder {
    config: SyncConfig,
    store: Arc<dyn KvStore>,
    remote: Arc<dyn RemoteService>,
    resolver: Arc<dyn ConflictResolver>,
    clock: Arc<dyn Clock>,
    initial_network: NetworkState,
}

impl SyncEngineBuilder {
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connectivity assumed until the host reports otherwise. Default `offline`.
    pub fn initial_network(mut self, state: NetworkState) -> Self {
        self.initial_network = state;
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;

        let log = Arc::new(ChangeLog::open(
            Arc::clone(&self.store),
            self.config.device_id.clone(),
            Arc::clone(&self.clock),
        )?);
        let entities = Arc::new(KvEntityRepository::new(Arc::clone(&self.store)));
        let monitor = Arc::new(NetworkMonitor::new(
            self.initial_network,
            self.config.network_dwell_ms,
            Arc::clone(&self.clock),
        ));
        let coordinator = SyncCoordinator::new(
            &self.config,
            Arc::clone(&log),
            entities.clone(),
            Arc::clone(&monitor),
            self.remote,
            self.resolver,
            Arc::clone(&self.clock),
        )?;
        let todos = TodoService::new(Arc::clone(&log), entities.clone(), self.clock);

        info!(
            "event=engine_open module=engine status=ok device_id={} pending={}",
            self.config.device_id,
            log.pending_count()
        );
        Ok(SyncEngine {
            config: self.config,
            log,
            entities,
            monitor,
            coordinator,
            todos,
        })
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    log: Arc<ChangeLog>,
    entities: Arc<KvEntityRepository>,
    monitor: Arc<NetworkMonitor>,
    coordinator: SyncCoordinator,
    todos: TodoService,
}

impl SyncEngine {
    /// Starts a builder with last-write-wins resolution and the system clock.
    pub fn builder(
        config: SyncConfig,
        store: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteService>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            store,
            remote,
            resolver: Arc::new(LastWriteWins),
            clock: Arc::new(SystemClock),
            initial_network: NetworkState::Offline,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn todos(&self) -> &TodoService {
        &self.todos
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn report_network(&self, state: NetworkState) -> Option<NetworkTransition> {
        self.monitor.report(state)
    }

    pub fn poll(&self) -> SyncResult<PassOutcome> {
        self.coordinator.poll()
    }

    pub fn sync_now(&self) -> SyncResult<PassOutcome> {
        self.coordinator.sync_now()
    }

    pub fn status(&self) -> SyncStatusView {
        let mut view = self.coordinator.status();
        view.buffered_writes += self.entities.buffered_count();
        view
    }

    /// Retries buffered local writes. Returns how many reached storage.
    ///
    /// Entity writes are attempted even when change log writes still fail.
    pub fn flush_storage(&self) -> SyncResult<usize> {
        let logged = self.log.flush();
        let entities = self.entities.flush();
        match (logged, entities) {
            (Ok(logged), Ok(entities)) => Ok(logged + entities),
            (Err(err), _) | (_, Err(err)) => {
                warn!(
                    "event=storage_flush module=engine status=error error_code={}",
                    err.kind().code()
                );
                Err(err)
            }
        }
    }
}
