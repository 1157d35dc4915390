//! Namespaces
//!
//! Every engine instance opened on the same namespace name shares one
//! [`Namespace`]: one catalog, one scheduler and one set of running
//! transfers, all behind a single lock. Events are emitted while that lock is
//! held, so listeners observe state changes in the order they were committed.

use crate::catalog::Catalog;
use crate::engine::network::NetworkGate;
use crate::engine::scheduler::Scheduler;
use crate::engine::transfer::{TransferContext, TransferOutcome, Transfers, Transport};
use crate::engine::{Collaborators, DownloadDatabase, DownloadRepository};
use crate::error::FetchError;
use crate::fs::FileSystem;
use crate::lifecycle;
use crate::notify::Fanout;
use fetchq_types::{Download, DownloadBlock, DownloadEvent, EngineConfig, EventKind, Status};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything guarded by the namespace lock
pub(crate) struct EngineState {
    pub catalog: Catalog,
    pub scheduler: Scheduler,
    pub gate: NetworkGate,
    pub transfers: Transfers,
    /// Automatic retries for requests that do not set their own
    pub auto_retry_max_attempts: u32,
}

pub(crate) struct Namespace {
    pub name: String,
    pub state: Mutex<EngineState>,
    pub fanout: Fanout,
    pub file_system: Arc<dyn FileSystem>,
    transport: Arc<dyn Transport>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

struct Entry {
    namespace: Arc<Namespace>,
    handles: usize,
}

fn open_namespaces() -> &'static Mutex<HashMap<String, Entry>> {
    static NAMESPACES: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();
    NAMESPACES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get the live namespace called `config.namespace`, opening it if no
/// instance holds it yet. Configuration and collaborators only apply when
/// the namespace is opened.
pub(crate) async fn acquire(
    config: EngineConfig,
    collaborators: Collaborators,
) -> Result<Arc<Namespace>, FetchError> {
    let mut namespaces = open_namespaces().lock().await;
    if let Some(entry) = namespaces.get_mut(&config.namespace) {
        entry.handles += 1;
        debug!(
            "Joined namespace {} ({} instances)",
            config.namespace, entry.handles
        );
        return Ok(Arc::clone(&entry.namespace));
    }

    let name = config.namespace.clone();
    let namespace = Namespace::open(config, collaborators).await?;
    namespaces.insert(
        name,
        Entry {
            namespace: Arc::clone(&namespace),
            handles: 1,
        },
    );
    Ok(namespace)
}

/// Give back one instance's hold on `namespace`. The last one out shuts it
/// down.
pub(crate) async fn release(namespace: &Arc<Namespace>) {
    let mut namespaces = open_namespaces().lock().await;
    let last = match namespaces.get_mut(&namespace.name) {
        Some(entry) if Arc::ptr_eq(&entry.namespace, namespace) => {
            entry.handles -= 1;
            entry.handles == 0
        }
        _ => false,
    };

    if last {
        namespaces.remove(&namespace.name);
        namespace.shutdown().await;
    }
}

impl Namespace {
    async fn open(config: EngineConfig, collaborators: Collaborators) -> Result<Arc<Self>, FetchError> {
        let repository: Arc<dyn DownloadRepository> = match collaborators.repository {
            Some(repository) => repository,
            None if config.in_memory => Arc::new(DownloadDatabase::in_memory().await?),
            None => Arc::new(DownloadDatabase::new(config.database_path()).await?),
        };

        let mut catalog = Catalog::load(repository).await?;
        let mut scheduler = Scheduler::new(config.concurrent_limit);

        // Transfers do not survive the process, so interrupted rows go back in line
        for mut download in catalog.select(|d| d.status == Status::Downloading) {
            lifecycle::transition(&mut download, Status::Queued)?;
            catalog.save(download).await?;
        }
        for download in catalog.select(|d| d.status == Status::Queued) {
            scheduler.enqueue(&download);
        }

        info!(
            "Opened namespace {} with {} downloads ({} queued)",
            config.namespace,
            catalog.len(),
            scheduler.waiting_len()
        );

        let namespace = Arc::new(Self {
            name: config.namespace.clone(),
            state: Mutex::new(EngineState {
                catalog,
                scheduler,
                gate: NetworkGate::new(config.global_network_type, collaborators.connectivity),
                transfers: Transfers::new(),
                auto_retry_max_attempts: config.auto_retry_max_attempts,
            }),
            fanout: Fanout::new(config.event_buffer),
            file_system: collaborators.file_system,
            transport: collaborators.transport,
            monitor: parking_lot::Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let interval = Duration::from_millis(config.network_check_interval_ms.max(1));
        let monitor = tokio::spawn(monitor_network(Arc::downgrade(&namespace), interval));
        *namespace.monitor.lock() = Some(monitor);

        {
            let mut state = namespace.state.lock().await;
            namespace.admit(&mut state).await?;
        }

        Ok(namespace)
    }

    /// Stop every transfer and put it back in line for the next open
    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }

        let mut state = self.state.lock().await;
        for id in state.transfers.interrupt_all() {
            let Some(mut download) = state.catalog.get(id) else {
                continue;
            };
            if lifecycle::transition(&mut download, Status::Queued).is_ok() {
                if let Err(e) = state.catalog.save(download).await {
                    warn!("Failed to requeue {} on shutdown: {}", id, e);
                }
            }
        }
        info!("Closed namespace {}", self.name);
    }

    pub fn emit(&self, kind: EventKind, download: &Download) {
        self.fanout
            .dispatch(DownloadEvent::new(kind, download.clone()));
    }

    /// Move a row to `to`, apply `update`, persist, keep the scheduler and
    /// the running transfers in step, and emit `kind`.
    pub async fn move_with(
        &self,
        state: &mut EngineState,
        id: Uuid,
        to: Status,
        kind: EventKind,
        update: impl FnOnce(&mut Download),
    ) -> Result<Option<Download>, FetchError> {
        let Some(mut download) = state.catalog.get(id) else {
            return Ok(None);
        };
        let from = download.status;
        lifecycle::transition(&mut download, to)?;
        update(&mut download);
        let download = state.catalog.save(download).await?;

        if from == Status::Queued {
            state.scheduler.withdraw(id);
        }
        if to == Status::Queued {
            state.scheduler.enqueue(&download);
        }
        if from == Status::Downloading {
            state.transfers.interrupt(id);
        }

        self.emit(kind, &download);
        Ok(Some(download))
    }

    pub async fn move_to(
        &self,
        state: &mut EngineState,
        id: Uuid,
        to: Status,
        kind: EventKind,
    ) -> Result<Option<Download>, FetchError> {
        self.move_with(state, id, to, kind, |_| {}).await
    }

    /// Queued event for `download`, flagged when the network gate holds it
    pub fn queued_event(state: &EngineState, download: &Download) -> EventKind {
        EventKind::Queued {
            waiting_on_network: !state.gate.permits(download.network_type()),
        }
    }

    /// Drop a row from the catalog and everything tracking it. With
    /// `delete_file` the target file goes too. Listeners hear of it only when
    /// `notify` is set.
    pub async fn drop_download(
        &self,
        state: &mut EngineState,
        id: Uuid,
        delete_file: bool,
        notify: bool,
    ) -> Result<Option<Download>, FetchError> {
        let Some(mut snapshot) = state.catalog.get(id) else {
            return Ok(None);
        };
        let (to, kind) = if delete_file {
            (Status::Deleted, EventKind::Deleted)
        } else {
            (Status::Removed, EventKind::Removed)
        };
        lifecycle::transition(&mut snapshot, to)?;

        state.catalog.drop_row(id).await?;
        state.scheduler.withdraw(id);
        state.scheduler.forget_frozen(id);
        state.transfers.interrupt(id);

        if delete_file {
            if let Err(e) = self.file_system.delete_file(snapshot.file()).await {
                warn!("Failed to delete {}: {}", snapshot.file().display(), e);
            }
        }

        if notify {
            self.emit(kind, &snapshot);
        }
        Ok(Some(snapshot))
    }

    /// Start as many waiting downloads as the limit, the freeze and the
    /// network gate allow
    pub async fn admit(self: &Arc<Self>, state: &mut EngineState) -> Result<(), FetchError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Ok(());
        }

        let batch = {
            let EngineState {
                catalog,
                scheduler,
                gate,
                transfers,
                ..
            } = &*state;
            scheduler.next_batch(transfers.running_len(), |id| {
                !transfers.is_busy(id)
                    && catalog
                        .peek(id)
                        .is_some_and(|d| gate.permits(d.network_type()))
            })
        };

        for id in batch {
            if let Some(download) = self
                .move_to(state, id, Status::Downloading, EventKind::Started)
                .await?
            {
                debug!("Starting download {} ({})", id, download.url());
                self.spawn_transfer(state, download);
            }
        }
        Ok(())
    }

    fn spawn_transfer(self: &Arc<Self>, state: &mut EngineState, download: Download) {
        let id = download.id;
        let blocks = state.catalog.blocks(id);
        let (token, interrupted) = state.transfers.register(id);
        let ctx = TransferContext::new(id, token, interrupted, Arc::downgrade(self));
        let transport = Arc::clone(&self.transport);
        let namespace = Arc::clone(self);

        tokio::spawn(async move {
            let result = AssertUnwindSafe(transport.transfer(download, blocks, ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(FetchError::Transport("transfer panicked".to_string())));
            namespace.finish_transfer(id, token, result).await;
        });
    }

    async fn finish_transfer(
        self: &Arc<Self>,
        id: Uuid,
        token: u64,
        result: Result<TransferOutcome, FetchError>,
    ) {
        let mut state = self.state.lock().await;
        if let Err(e) = self.settle_transfer(&mut state, id, token, result).await {
            warn!("Failed to record the end of transfer {}: {}", id, e);
        }
        if let Err(e) = self.admit(&mut state).await {
            warn!("Failed to admit downloads in {}: {}", self.name, e);
        }
    }

    async fn settle_transfer(
        &self,
        state: &mut EngineState,
        id: Uuid,
        token: u64,
        result: Result<TransferOutcome, FetchError>,
    ) -> Result<(), FetchError> {
        if !state.transfers.finish(id, token) {
            debug!("Interrupted transfer {} returned", id);
            return Ok(());
        }
        let Some(download) = state.catalog.peek(id) else {
            return Ok(());
        };
        if download.status != Status::Downloading {
            return Ok(());
        }
        let (downloaded, total) = (download.downloaded, download.total);
        let attempts = download.auto_retry_attempts;
        let max_attempts = download
            .request
            .auto_retry_max_attempts
            .unwrap_or(state.auto_retry_max_attempts);

        match result {
            Ok(TransferOutcome::Completed) => match total {
                Some(total) if downloaded != total => {
                    let error = format!("transfer ended at {downloaded} of {total} bytes");
                    warn!("Download {} failed: {}", id, error);
                    self.move_with(state, id, Status::Failed, EventKind::Failed, |d| {
                        d.error = Some(error)
                    })
                    .await?;
                }
                _ => {
                    info!("Download {} completed ({} bytes)", id, downloaded);
                    self.move_with(state, id, Status::Completed, EventKind::Completed, |d| {
                        d.total = Some(d.downloaded)
                    })
                    .await?;
                }
            },
            Ok(TransferOutcome::Interrupted) => {
                self.move_to(state, id, Status::Paused, EventKind::Paused)
                    .await?;
            }
            Err(error) if error.is_retryable() && attempts < max_attempts => {
                info!(
                    "Retrying download {} ({}/{}): {}",
                    id,
                    attempts + 1,
                    max_attempts,
                    error
                );
                let kind = EventKind::Queued {
                    waiting_on_network: false,
                };
                self.move_with(state, id, Status::Queued, kind, |d| {
                    d.auto_retry_attempts += 1
                })
                .await?;
            }
            Err(error) => {
                warn!("Download {} failed: {}", id, error);
                self.move_with(state, id, Status::Failed, EventKind::Failed, |d| {
                    d.error = Some(error.to_string())
                })
                .await?;
            }
        }
        Ok(())
    }

    pub async fn record_progress(
        &self,
        id: Uuid,
        token: u64,
        downloaded: u64,
        total: Option<u64>,
    ) -> Result<(), FetchError> {
        let mut state = self.state.lock().await;
        if !state.transfers.is_current(id, token) {
            return Ok(());
        }
        if let Some(download) = state.catalog.save_progress(id, downloaded, total).await? {
            self.emit(EventKind::Progress, &download);
        }
        Ok(())
    }

    pub async fn record_block(&self, id: Uuid, token: u64, block: DownloadBlock) -> Result<(), FetchError> {
        if block.download_id != id {
            return Err(FetchError::InvalidOperation(format!(
                "block of {} reported by transfer {}",
                block.download_id, id
            )));
        }

        let mut state = self.state.lock().await;
        if !state.transfers.is_current(id, token) {
            return Ok(());
        }
        if let Some(download) = state.catalog.save_block(block.clone()).await? {
            self.emit(EventKind::BlockUpdated { block }, &download);
        }
        Ok(())
    }

    /// Pause running transfers whose network went away and admit whatever
    /// the gate now lets through
    pub async fn check_network(self: &Arc<Self>) -> Result<(), FetchError> {
        let mut state = self.state.lock().await;
        self.enforce_network(&mut state).await?;
        self.admit(&mut state).await
    }

    pub async fn enforce_network(&self, state: &mut EngineState) -> Result<(), FetchError> {
        let blocked: Vec<Uuid> = state
            .transfers
            .running_ids()
            .into_iter()
            .filter(|id| {
                state
                    .catalog
                    .peek(*id)
                    .is_some_and(|d| !state.gate.permits(d.network_type()))
            })
            .collect();

        for id in blocked {
            info!("Network lost for download {}, pausing", id);
            self.move_to(state, id, Status::Paused, EventKind::Paused)
                .await?;
        }
        Ok(())
    }
}

async fn monitor_network(namespace: Weak<Namespace>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(namespace) = namespace.upgrade() else {
            break;
        };
        if let Err(e) = namespace.check_network().await {
            warn!("Network check failed in {}: {}", namespace.name, e);
        }
    }
}
