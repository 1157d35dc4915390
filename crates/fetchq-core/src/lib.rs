//! fetchq core - download engine
//!
//! Keeps a persistent catalog of downloads per namespace, admits queued
//! downloads by priority under a concurrency limit, and drives transfers
//! through a caller-supplied [`Transport`]. State changes are fanned out to
//! listeners and broadcast subscribers.

mod catalog;
mod engine;
mod error;
mod fs;
mod lifecycle;
mod notify;
mod registry;

pub use engine::{
    AlwaysConnected, Collaborators, Connectivity, DownloadDatabase, DownloadRepository, EnqueueResult,
    TransferContext, TransferOutcome, Transport,
};
pub use error::*;
pub use fs::{FileSystem, TokioFileSystem};
pub use lifecycle::can_transition;
pub use notify::DownloadListener;

use engine::{Namespace, Selection};
use fetchq_types::{
    CompletedDownload, Download, DownloadBlock, DownloadEvent, EngineConfig, GroupSummary, ListenerOptions,
    NetworkType, Request, Status,
};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

struct EngineHandle {
    id: u64,
    namespace: Arc<Namespace>,
    closed: AtomicBool,
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.namespace.fanout.detach_owner(self.id);
        // Without a runtime the hold is only given back when the process exits
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let namespace = Arc::clone(&self.namespace);
            runtime.spawn(async move { engine::release(&namespace).await });
        }
    }
}

/// One engine instance.
///
/// Clones share the instance; [`DownloadEngine::close`] closes all of them.
/// Instances opened on the same namespace share one catalog.
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineHandle>,
}

impl DownloadEngine {
    /// Open an instance on `config.namespace`
    pub async fn open(config: EngineConfig, collaborators: Collaborators) -> Result<Self, FetchError> {
        let namespace = engine::acquire(config, collaborators).await?;
        let id = NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst);
        debug!("Opened engine instance {} on {}", id, namespace.name);
        Ok(Self {
            inner: Arc::new(EngineHandle {
                id,
                namespace,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Set the configuration [`DownloadEngine::default_instance`] opens with.
    /// A live default instance is kept until it is closed.
    pub async fn set_default_config(config: EngineConfig, collaborators: Collaborators) {
        registry::set_default_config(config, collaborators).await
    }

    /// The process-wide default instance, opened lazily and reopened after
    /// it was closed
    pub async fn default_instance() -> Result<Self, FetchError> {
        registry::default_instance().await
    }

    fn live(&self) -> Result<&Arc<Namespace>, FetchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(FetchError::EngineClosed);
        }
        Ok(&self.inner.namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close this instance. Its listeners are detached; the namespace stays
    /// open while other instances hold it.
    pub async fn close(&self) -> Result<(), FetchError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(FetchError::EngineClosed);
        }
        self.inner.namespace.fanout.detach_owner(self.inner.id);
        engine::release(&self.inner.namespace).await;
        debug!("Closed engine instance {}", self.inner.id);
        Ok(())
    }

    // ========================================================================
    // Intake
    // ========================================================================

    /// Enqueue one request, resolving collisions by its enqueue action
    pub async fn enqueue(&self, request: Request) -> Result<Download, FetchError> {
        let mut results = self.live()?.enqueue(vec![request]).await?;
        match results.pop() {
            Some((_, result)) => result,
            None => Err(FetchError::InvalidOperation("enqueue returned no result".to_string())),
        }
    }

    /// Enqueue a batch. Each request gets its own result; the call only fails
    /// as a whole when storage cannot be reached.
    pub async fn enqueue_all(&self, requests: Vec<Request>) -> Result<Vec<EnqueueResult>, FetchError> {
        self.live()?.enqueue(requests).await
    }

    /// Adopt a file transferred outside the engine as a completed download
    pub async fn add_completed_download(
        &self,
        completed: CompletedDownload,
        alert_listeners: bool,
    ) -> Result<Download, FetchError> {
        let mut added = self
            .live()?
            .add_completed(vec![completed], alert_listeners)
            .await?;
        added
            .pop()
            .ok_or_else(|| FetchError::InvalidOperation("nothing was adopted".to_string()))
    }

    pub async fn add_completed_downloads(
        &self,
        completed: Vec<CompletedDownload>,
        alert_listeners: bool,
    ) -> Result<Vec<Download>, FetchError> {
        self.live()?.add_completed(completed, alert_listeners).await
    }

    // ========================================================================
    // Pause / resume / cancel / retry
    // ========================================================================

    pub async fn pause(&self, id: Uuid) -> Result<Option<Download>, FetchError> {
        Ok(self.live()?.pause(Selection::Ids(vec![id])).await?.pop())
    }

    pub async fn pause_all_ids(&self, ids: Vec<Uuid>) -> Result<Vec<Download>, FetchError> {
        self.live()?.pause(Selection::Ids(ids)).await
    }

    pub async fn pause_group(&self, group_id: i32) -> Result<Vec<Download>, FetchError> {
        self.live()?.pause(Selection::Group(group_id)).await
    }

    pub async fn pause_all(&self) -> Result<Vec<Download>, FetchError> {
        self.live()?.pause(Selection::All).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<Option<Download>, FetchError> {
        Ok(self.live()?.resume(Selection::Ids(vec![id])).await?.pop())
    }

    pub async fn resume_ids(&self, ids: Vec<Uuid>) -> Result<Vec<Download>, FetchError> {
        self.live()?.resume(Selection::Ids(ids)).await
    }

    pub async fn resume_group(&self, group_id: i32) -> Result<Vec<Download>, FetchError> {
        self.live()?.resume(Selection::Group(group_id)).await
    }

    pub async fn resume_all(&self) -> Result<Vec<Download>, FetchError> {
        self.live()?.resume(Selection::All).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Option<Download>, FetchError> {
        Ok(self.live()?.cancel(Selection::Ids(vec![id])).await?.pop())
    }

    pub async fn cancel_ids(&self, ids: Vec<Uuid>) -> Result<Vec<Download>, FetchError> {
        self.live()?.cancel(Selection::Ids(ids)).await
    }

    pub async fn cancel_group(&self, group_id: i32) -> Result<Vec<Download>, FetchError> {
        self.live()?.cancel(Selection::Group(group_id)).await
    }

    pub async fn cancel_all(&self) -> Result<Vec<Download>, FetchError> {
        self.live()?.cancel(Selection::All).await
    }

    pub async fn retry(&self, id: Uuid) -> Result<Option<Download>, FetchError> {
        Ok(self.live()?.retry(Selection::Ids(vec![id])).await?.pop())
    }

    pub async fn retry_ids(&self, ids: Vec<Uuid>) -> Result<Vec<Download>, FetchError> {
        self.live()?.retry(Selection::Ids(ids)).await
    }

    /// Reset the automatic retry counter, optionally retrying a failed or
    /// cancelled download right away
    pub async fn reset_auto_retry_attempts(&self, id: Uuid, retry: bool) -> Result<Option<Download>, FetchError> {
        self.live()?.reset_auto_retry_attempts(id, retry).await
    }

    // ========================================================================
    // Remove / delete
    // ========================================================================

    /// Drop a download from the catalog, keeping its file
    pub async fn remove(&self, id: Uuid) -> Result<Option<Download>, FetchError> {
        Ok(self
            .live()?
            .remove(Selection::Ids(vec![id]), false)
            .await?
            .pop())
    }

    pub async fn remove_ids(&self, ids: Vec<Uuid>) -> Result<Vec<Download>, FetchError> {
        self.live()?.remove(Selection::Ids(ids), false).await
    }

    pub async fn remove_group(&self, group_id: i32) -> Result<Vec<Download>, FetchError> {
        self.live()?.remove(Selection::Group(group_id), false).await
    }

    pub async fn remove_all(&self) -> Result<Vec<Download>, FetchError> {
        self.live()?.remove(Selection::All, false).await
    }

    pub async fn remove_all_with_status(&self, status: Status) -> Result<Vec<Download>, FetchError> {
        self.live()?
            .remove(Selection::Statuses(vec![status]), false)
            .await
    }

    pub async fn remove_all_in_group_with_status(
        &self,
        group_id: i32,
        statuses: Vec<Status>,
    ) -> Result<Vec<Download>, FetchError> {
        self.live()?
            .remove(Selection::GroupStatuses(group_id, statuses), false)
            .await
    }

    /// Drop a download from the catalog and delete its file
    pub async fn delete(&self, id: Uuid) -> Result<Option<Download>, FetchError> {
        Ok(self
            .live()?
            .remove(Selection::Ids(vec![id]), true)
            .await?
            .pop())
    }

    pub async fn delete_ids(&self, ids: Vec<Uuid>) -> Result<Vec<Download>, FetchError> {
        self.live()?.remove(Selection::Ids(ids), true).await
    }

    pub async fn delete_group(&self, group_id: i32) -> Result<Vec<Download>, FetchError> {
        self.live()?.remove(Selection::Group(group_id), true).await
    }

    pub async fn delete_all(&self) -> Result<Vec<Download>, FetchError> {
        self.live()?.remove(Selection::All, true).await
    }

    pub async fn delete_all_with_status(&self, status: Status) -> Result<Vec<Download>, FetchError> {
        self.live()?
            .remove(Selection::Statuses(vec![status]), true)
            .await
    }

    pub async fn delete_all_in_group_with_status(
        &self,
        group_id: i32,
        statuses: Vec<Status>,
    ) -> Result<Vec<Download>, FetchError> {
        self.live()?
            .remove(Selection::GroupStatuses(group_id, statuses), true)
            .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_download(&self, id: Uuid) -> Result<Option<Download>, FetchError> {
        Ok(self.live()?.read(|s| s.catalog.get(id)).await)
    }

    /// Every download, in enqueue order
    pub async fn get_downloads(&self) -> Result<Vec<Download>, FetchError> {
        Ok(self.live()?.read(|s| s.catalog.all()).await)
    }

    pub async fn get_downloads_by_ids(&self, ids: Vec<Uuid>) -> Result<Vec<Download>, FetchError> {
        Ok(self
            .live()?
            .read(|s| ids.iter().filter_map(|id| s.catalog.get(*id)).collect())
            .await)
    }

    pub async fn get_downloads_in_group(&self, group_id: i32) -> Result<Vec<Download>, FetchError> {
        Ok(self
            .live()?
            .read(|s| s.catalog.select(|d| d.group_id() == group_id))
            .await)
    }

    pub async fn get_downloads_with_status(&self, status: Status) -> Result<Vec<Download>, FetchError> {
        Ok(self
            .live()?
            .read(|s| s.catalog.select(|d| d.status == status))
            .await)
    }

    pub async fn get_downloads_with_statuses(&self, statuses: Vec<Status>) -> Result<Vec<Download>, FetchError> {
        Ok(self
            .live()?
            .read(|s| s.catalog.select(|d| statuses.contains(&d.status)))
            .await)
    }

    pub async fn get_downloads_in_group_with_status(
        &self,
        group_id: i32,
        statuses: Vec<Status>,
    ) -> Result<Vec<Download>, FetchError> {
        Ok(self
            .live()?
            .read(|s| {
                s.catalog
                    .select(|d| d.group_id() == group_id && statuses.contains(&d.status))
            })
            .await)
    }

    pub async fn get_downloads_by_identifier(&self, identifier: i64) -> Result<Vec<Download>, FetchError> {
        Ok(self
            .live()?
            .read(|s| s.catalog.select(|d| d.request.identifier == identifier))
            .await)
    }

    pub async fn get_downloads_by_tag(&self, tag: &str) -> Result<Vec<Download>, FetchError> {
        Ok(self
            .live()?
            .read(|s| s.catalog.select(|d| d.request.tag.as_deref() == Some(tag)))
            .await)
    }

    /// Persisted transfer layout of a download, by position
    pub async fn get_download_blocks(&self, id: Uuid) -> Result<Vec<DownloadBlock>, FetchError> {
        Ok(self.live()?.read(|s| s.catalog.blocks(id)).await)
    }

    pub async fn get_group(&self, group_id: i32) -> Result<GroupSummary, FetchError> {
        let downloads = self.get_downloads_in_group(group_id).await?;
        Ok(GroupSummary::from_downloads(group_id, downloads))
    }

    pub async fn get_all_group_ids(&self) -> Result<Vec<i32>, FetchError> {
        Ok(self
            .live()?
            .read(|s| {
                s.catalog
                    .all()
                    .iter()
                    .map(Download::group_id)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .await)
    }

    /// Whether anything is queued or downloading, counting ADDED downloads
    /// too when `include_added`
    pub async fn has_active_downloads(&self, include_added: bool) -> Result<bool, FetchError> {
        Ok(self
            .live()?
            .read(|s| {
                !s.catalog
                    .select(|d| {
                        matches!(d.status, Status::Queued | Status::Downloading)
                            || (include_added && d.status == Status::Added)
                    })
                    .is_empty()
            })
            .await)
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Pause every running download and stop admitting. Returns true once
    /// frozen, also when it already was.
    pub async fn freeze(&self) -> Result<bool, FetchError> {
        self.live()?.freeze().await
    }

    /// Resume admission, requeueing the downloads the freeze paused. Returns
    /// true once unfrozen, also when it was not frozen.
    pub async fn unfreeze(&self) -> Result<bool, FetchError> {
        self.live()?.unfreeze().await
    }

    pub async fn is_frozen(&self) -> Result<bool, FetchError> {
        Ok(self.live()?.is_frozen().await)
    }

    /// Set how many downloads may transfer at once. Negative limits are
    /// rejected; 0 stops admission without pausing running transfers.
    pub async fn set_concurrent_limit(&self, limit: i64) -> Result<(), FetchError> {
        self.live()?.set_concurrent_limit(limit).await
    }

    pub async fn concurrent_limit(&self) -> Result<u32, FetchError> {
        Ok(self.live()?.concurrent_limit().await)
    }

    /// Override the network requirement of every download, or clear the
    /// override with `None`
    pub async fn set_global_network_type(&self, network_type: Option<NetworkType>) -> Result<(), FetchError> {
        self.live()?.set_global_network_type(network_type).await
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    pub async fn update_request(
        &self,
        id: Uuid,
        request: Request,
        notify: bool,
    ) -> Result<Option<Download>, FetchError> {
        self.live()?.update_request(id, request, notify).await
    }

    pub async fn replace_extras(
        &self,
        id: Uuid,
        extras: HashMap<String, String>,
    ) -> Result<Option<Download>, FetchError> {
        self.live()?.replace_extras(id, extras).await
    }

    pub async fn rename_completed_file(
        &self,
        id: Uuid,
        new_file: impl Into<PathBuf>,
    ) -> Result<Option<Download>, FetchError> {
        self.live()?.rename_completed_file(id, new_file.into()).await
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Attach a listener to this instance. Returns false if it was already
    /// attached.
    pub async fn add_listener(
        &self,
        listener: Arc<dyn DownloadListener>,
        options: ListenerOptions,
    ) -> Result<bool, FetchError> {
        Ok(self
            .live()?
            .attach_listener(self.inner.id, listener, options)
            .await)
    }

    pub async fn remove_listener(&self, listener: &Arc<dyn DownloadListener>) -> Result<bool, FetchError> {
        Ok(self.live()?.fanout.detach(listener))
    }

    /// Listeners attached through this instance
    pub async fn listener_count(&self) -> Result<usize, FetchError> {
        Ok(self.live()?.fanout.count(self.inner.id))
    }

    /// Receive every event of the namespace on a channel
    pub fn subscribe(&self) -> Result<broadcast::Receiver<DownloadEvent>, FetchError> {
        Ok(self.live()?.fanout.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NeverStarts;

    #[async_trait]
    impl Transport for NeverStarts {
        async fn transfer(
            &self,
            _download: Download,
            _blocks: Vec<DownloadBlock>,
            _ctx: TransferContext,
        ) -> Result<TransferOutcome, FetchError> {
            Err(FetchError::Transport("no transport".to_string()))
        }
    }

    fn config(namespace: &str) -> EngineConfig {
        EngineConfig::in_memory(namespace).with_concurrent_limit(0)
    }

    #[tokio::test]
    async fn test_closed_instance_rejects_operations() {
        let engine = DownloadEngine::open(config("lib-closed"), Collaborators::new(Arc::new(NeverStarts)))
            .await
            .unwrap();
        engine.close().await.unwrap();

        assert!(engine.is_closed());
        assert!(matches!(engine.get_downloads().await, Err(FetchError::EngineClosed)));
        assert!(matches!(engine.close().await, Err(FetchError::EngineClosed)));
        assert!(matches!(engine.subscribe(), Err(FetchError::EngineClosed)));
    }

    #[tokio::test]
    async fn test_negative_limit_is_rejected() {
        let engine = DownloadEngine::open(config("lib-limit"), Collaborators::new(Arc::new(NeverStarts)))
            .await
            .unwrap();

        assert!(matches!(
            engine.set_concurrent_limit(-1).await,
            Err(FetchError::InvalidConcurrentLimit(-1))
        ));
        engine.set_concurrent_limit(0).await.unwrap();
        assert_eq!(engine.concurrent_limit().await.unwrap(), 0);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_group_ids_are_distinct_and_sorted() {
        let engine = DownloadEngine::open(config("lib-groups"), Collaborators::new(Arc::new(NeverStarts)))
            .await
            .unwrap();
        for (file, group) in [("/tmp/g/a", 7), ("/tmp/g/b", 3), ("/tmp/g/c", 7)] {
            engine
                .enqueue(Request::new("https://example.com/g", file).with_group(group))
                .await
                .unwrap();
        }

        assert_eq!(engine.get_all_group_ids().await.unwrap(), vec![3, 7]);
        let group = engine.get_group(7).await.unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group.queued, 2);
        assert!(engine.has_active_downloads(false).await.unwrap());
        engine.close().await.unwrap();
    }
}
