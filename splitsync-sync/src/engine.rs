//! `SyncEngine`: the service object a host constructs and owns.
//!
//! Nothing here is global; several engines over separate stores can run in
//! one process.

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityHandle, ConnectivityMonitor};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::orchestrator::{DrainReport, DrainState, FullSyncReport, SyncOrchestrator};
use crate::queue::OperationQueue;
use crate::remapper::IdRemapper;
use crate::repository::EntityRepository;
use crate::validation::SplitValidator;
use splitsync_cloud::RemoteApi;
use splitsync_storage::{LocalStore, StoreChange};
use splitsync_types::{OperationId, PendingOperation, SyncMetadata};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SyncEngine {
    store: LocalStore,
    repository: EntityRepository,
    remapper: IdRemapper,
    orchestrator: Arc<SyncOrchestrator>,
    connectivity: ConnectivityHandle,
    config: SyncConfig,
    monitor: Mutex<Option<MonitorTask>>,
}

impl SyncEngine {
    /// Builds an engine over `store` and recovers from an unclean shutdown:
    /// operations left in flight go back to pending and a stale drain flag is
    /// cleared. Starts offline; call [`SyncEngine::set_online`] once the
    /// platform reports connectivity.
    pub fn init(
        store: LocalStore,
        api: Arc<dyn RemoteApi>,
        validator: Arc<dyn SplitValidator>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        config.validate()?;

        let queue = OperationQueue::new(store.clone());
        let reset = queue.reset_in_flight()?;
        let stale = store.write(|t| t.clear_stale_drain())?;
        if reset > 0 || stale {
            warn!(reset, stale_drain_flag = stale, "recovered from interrupted sync");
        }

        let connectivity = ConnectivityHandle::new(false);
        let orchestrator = Arc::new(SyncOrchestrator::new(store.clone(), api, config.clone()));
        let repository = EntityRepository::new(store.clone(), validator, connectivity.clone());
        info!(pending = queue.pending_count()?, "sync engine initialized");

        Ok(Self {
            remapper: IdRemapper::new(store.clone()),
            store,
            repository,
            orchestrator,
            connectivity,
            config,
            monitor: Mutex::new(None),
        })
    }

    fn lock_monitor(&self) -> std::sync::MutexGuard<'_, Option<MonitorTask>> {
        self.monitor.lock().unwrap_or_else(|poisoned| {
            warn!("[SyncEngine] recovering from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Spawns the connectivity monitor on the current tokio runtime. Calling
    /// it again while running is a no-op.
    pub fn start(&self) -> SyncResult<()> {
        let mut slot = self.lock_monitor();
        if slot.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::InvalidState("start() needs a tokio runtime".into()))?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let monitor = ConnectivityMonitor::new(
            self.orchestrator.clone(),
            self.connectivity.clone(),
            self.config.poll_interval(),
        );
        let handle = runtime.spawn(monitor.run(shutdown_rx));
        *slot = Some(MonitorTask { shutdown, handle });
        info!("sync engine started");
        Ok(())
    }

    /// Stops the monitor and waits for it. A drain in progress finishes first.
    pub async fn shutdown(&self) {
        let task = self.lock_monitor().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!("monitor task ended abnormally: {e}");
            }
            info!("sync engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_monitor().is_some()
    }

    pub fn repository(&self) -> &EntityRepository {
        &self.repository
    }

    pub fn remapper(&self) -> &IdRemapper {
        &self.remapper
    }

    pub fn set_online(&self, online: bool) {
        if self.connectivity.set_online(online) {
            info!(online, "connectivity reported");
            self.orchestrator
                .emit(SyncEvent::ConnectivityChanged { online });
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Drains now instead of waiting for the monitor.
    pub async fn sync_now(&self) -> SyncResult<DrainReport> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.orchestrator.drain().await
    }

    pub async fn full_sync(&self) -> SyncResult<FullSyncReport> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.orchestrator.full_sync().await
    }

    /// Status stream for the UI.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.orchestrator.subscribe()
    }

    /// Committed cache changes, for views that re-render on data change.
    pub fn store_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }

    pub fn drain_state(&self) -> DrainState {
        self.orchestrator.state()
    }

    pub fn pending_operations(&self) -> SyncResult<Vec<PendingOperation>> {
        self.orchestrator.queue().list()
    }

    pub fn pending_count(&self) -> SyncResult<usize> {
        self.orchestrator.queue().pending_count()
    }

    /// Operations the server rejected, awaiting a discard or a retry.
    pub fn conflicts(&self) -> SyncResult<Vec<PendingOperation>> {
        self.orchestrator.queue().conflicts()
    }

    pub fn discard_operation(&self, id: &OperationId) -> SyncResult<Vec<OperationId>> {
        self.orchestrator.discard_operation(id)
    }

    pub fn retry_operation(&self, id: &OperationId) -> SyncResult<Vec<OperationId>> {
        let reset = self.orchestrator.retry_operation(id)?;
        self.connectivity.nudge();
        Ok(reset)
    }

    pub fn metadata(&self) -> SyncResult<SyncMetadata> {
        Ok(self.store.read(|t| t.metadata())?)
    }
}
