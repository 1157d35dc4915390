//! Control plane
//!
//! Operations that change download state on behalf of callers. Each runs
//! entirely under the namespace lock. Bulk operations skip ids that are
//! missing or not eligible and return what they changed.

use crate::catalog::Catalog;
use crate::engine::namespace::{EngineState, Namespace};
use crate::error::FetchError;
use crate::lifecycle;
use crate::notify::DownloadListener;
use fetchq_types::{
    CompletedDownload, Download, DownloadEvent, EnqueueAction, EventKind, ListenerOptions, NetworkType, Request,
    Status,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which downloads a bulk operation applies to
#[derive(Debug, Clone)]
pub(crate) enum Selection {
    Ids(Vec<Uuid>),
    Group(i32),
    All,
    Statuses(Vec<Status>),
    GroupStatuses(i32, Vec<Status>),
}

impl Selection {
    fn resolve(&self, catalog: &Catalog) -> Vec<Uuid> {
        match self {
            Selection::Ids(ids) => {
                let mut seen = Vec::with_capacity(ids.len());
                for id in ids {
                    if catalog.contains(*id) && !seen.contains(id) {
                        seen.push(*id);
                    }
                }
                seen
            }
            Selection::Group(group) => catalog.select_ids(|d| d.group_id() == *group),
            Selection::All => catalog.select_ids(|_| true),
            Selection::Statuses(statuses) => catalog.select_ids(|d| statuses.contains(&d.status)),
            Selection::GroupStatuses(group, statuses) => {
                catalog.select_ids(|d| d.group_id() == *group && statuses.contains(&d.status))
            }
        }
    }
}

/// Result of enqueueing one request of a batch
pub type EnqueueResult = (Request, Result<Download, FetchError>);

fn validate_request(request: &Request) -> Result<(), FetchError> {
    url::Url::parse(&request.url)
        .map_err(|e| FetchError::InvalidRequest(format!("invalid url {}: {}", request.url, e)))?;
    if request.file.as_os_str().is_empty() {
        return Err(FetchError::InvalidRequest("file path is empty".to_string()));
    }
    Ok(())
}

/// `name (n).ext` for the smallest n no download writes to yet
fn next_free_file(catalog: &Catalog, file: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = file
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = file.parent().map(Path::to_path_buf).unwrap_or_default();

    (1u32..)
        .map(|n| parent.join(format!("{stem} ({n}){extension}")))
        .find(|candidate| catalog.find_by_file(candidate).is_none())
        .unwrap_or_else(|| file.to_path_buf())
}

/// Rows sharing the id or the target file of `request`
fn collisions(catalog: &Catalog, request: &Request) -> Vec<Download> {
    let mut found: Vec<Download> = catalog.get(request.id).into_iter().collect();
    if let Some(by_file) = catalog.find_by_file(&request.file) {
        if by_file.id != request.id {
            found.push(by_file);
        }
    }
    found
}

impl Namespace {
    pub async fn enqueue(self: &Arc<Self>, requests: Vec<Request>) -> Result<Vec<EnqueueResult>, FetchError> {
        let mut state = self.state.lock().await;
        let mut results = Vec::with_capacity(requests.len());

        for request in requests {
            match self.intake(&mut state, request.clone()).await {
                Err(e) if e.is_storage_failure() => return Err(e),
                outcome => results.push((request, outcome)),
            }
        }

        self.admit(&mut state).await?;
        Ok(results)
    }

    async fn intake(&self, state: &mut EngineState, request: Request) -> Result<Download, FetchError> {
        validate_request(&request)?;

        let existing = collisions(&state.catalog, &request);
        let request = if existing.is_empty() {
            request
        } else {
            match request.enqueue_action {
                EnqueueAction::ErrorIfExists => {
                    return Err(FetchError::DuplicateRequest(request.file));
                }
                EnqueueAction::Update => {
                    let target = existing
                        .iter()
                        .find(|d| d.request.file == request.file)
                        .unwrap_or(&existing[0])
                        .id;
                    return self.merge_request(state, target, request).await;
                }
                EnqueueAction::Replace => {
                    for old in &existing {
                        debug!("Replacing download {} for {}", old.id, request.file.display());
                        self.drop_download(state, old.id, true, true).await?;
                    }
                    request
                }
                EnqueueAction::IncrementFileName => {
                    let mut request = request;
                    if state.catalog.contains(request.id) {
                        request.id = Uuid::new_v4();
                    }
                    if state.catalog.find_by_file(&request.file).is_some() {
                        request.file = next_free_file(&state.catalog, &request.file);
                    }
                    request
                }
            }
        };

        let sequence = state.catalog.take_sequence();
        let mut download = Download::new(request, self.name.as_str(), sequence);
        let start = download.request.download_on_enqueue;
        let target = if start { Status::Queued } else { Status::Added };
        lifecycle::transition(&mut download, target)?;
        let download = state.catalog.save(download).await?;

        self.emit(EventKind::Added, &download);
        if start {
            state.scheduler.enqueue(&download);
            self.emit(Namespace::queued_event(state, &download), &download);
        }
        Ok(download)
    }

    /// Fold the mutable settings of `request` into an existing row. Identity,
    /// location, status and progress stay as they are.
    async fn merge_request(
        &self,
        state: &mut EngineState,
        id: Uuid,
        request: Request,
    ) -> Result<Download, FetchError> {
        let mut merged = state.catalog.get(id).ok_or(FetchError::NotFound(id))?;
        let current = &mut merged.request;
        current.priority = request.priority;
        current.network_type = request.network_type;
        current.group_id = request.group_id;
        current.tag = request.tag;
        current.identifier = request.identifier;
        current.headers = request.headers;
        current.extras = request.extras;
        current.auto_retry_max_attempts = request.auto_retry_max_attempts;

        let merged = state.catalog.save(merged).await?;
        if state.scheduler.is_waiting(id) {
            state.scheduler.enqueue(&merged);
        }
        self.emit(EventKind::Updated, &merged);
        Ok(merged)
    }

    /// Catalog files downloaded elsewhere. Invalid entries are skipped; only a
    /// storage failure fails the batch.
    pub async fn add_completed(
        &self,
        completed: Vec<CompletedDownload>,
        alert_listeners: bool,
    ) -> Result<Vec<Download>, FetchError> {
        let mut state = self.state.lock().await;
        let mut added = Vec::with_capacity(completed.len());

        for entry in completed {
            let file = entry.file.clone();
            match self.catalog_completed(&mut state, entry, alert_listeners).await {
                Ok(download) => added.push(download),
                Err(e) if e.is_storage_failure() => return Err(e),
                Err(e) => warn!("Skipping completed download {}: {}", file.display(), e),
            }
        }
        Ok(added)
    }

    async fn catalog_completed(
        &self,
        state: &mut EngineState,
        entry: CompletedDownload,
        alert_listeners: bool,
    ) -> Result<Download, FetchError> {
        let mut request = Request::new(entry.url, entry.file)
            .with_group(entry.group_id)
            .with_identifier(entry.identifier)
            .with_download_on_enqueue(false);
        request.tag = entry.tag;
        request.extras = entry.extras;
        validate_request(&request)?;

        if let Some(existing) = state.catalog.find_by_file(&request.file) {
            self.drop_download(state, existing.id, false, alert_listeners).await?;
        }

        let sequence = state.catalog.take_sequence();
        let mut download = Download::new(request, self.name.as_str(), sequence);
        download.created_at = entry.created;
        download.downloaded = entry.file_byte_size;
        download.total = Some(entry.file_byte_size);
        lifecycle::transition(&mut download, Status::Completed)?;
        let download = state.catalog.save(download).await?;

        if alert_listeners {
            self.emit(EventKind::Added, &download);
            self.emit(EventKind::Completed, &download);
        }
        Ok(download)
    }

    pub async fn pause(self: &Arc<Self>, selection: Selection) -> Result<Vec<Download>, FetchError> {
        let mut state = self.state.lock().await;
        let mut paused = Vec::new();
        for id in selection.resolve(&state.catalog) {
            if !state.catalog.status_of(id).is_some_and(lifecycle::is_pausable) {
                continue;
            }
            if let Some(download) = self
                .move_to(&mut state, id, Status::Paused, EventKind::Paused)
                .await?
            {
                paused.push(download);
            }
        }
        self.admit(&mut state).await?;
        Ok(paused)
    }

    pub async fn resume(self: &Arc<Self>, selection: Selection) -> Result<Vec<Download>, FetchError> {
        let mut state = self.state.lock().await;
        let mut resumed = Vec::new();
        for id in selection.resolve(&state.catalog) {
            let kind = match state.catalog.peek(id) {
                Some(download) if lifecycle::is_resumable(download.status) => {
                    if download.status == Status::Paused {
                        EventKind::Resumed
                    } else {
                        Namespace::queued_event(&state, download)
                    }
                }
                _ => continue,
            };
            state.scheduler.forget_frozen(id);
            if let Some(download) = self.move_to(&mut state, id, Status::Queued, kind).await? {
                resumed.push(download);
            }
        }
        self.admit(&mut state).await?;
        Ok(resumed)
    }

    pub async fn cancel(self: &Arc<Self>, selection: Selection) -> Result<Vec<Download>, FetchError> {
        let mut state = self.state.lock().await;
        let mut cancelled = Vec::new();
        for id in selection.resolve(&state.catalog) {
            if !state.catalog.status_of(id).is_some_and(lifecycle::is_cancellable) {
                continue;
            }
            state.scheduler.forget_frozen(id);
            if let Some(download) = self
                .move_to(&mut state, id, Status::Cancelled, EventKind::Cancelled)
                .await?
            {
                cancelled.push(download);
            }
        }
        self.admit(&mut state).await?;
        Ok(cancelled)
    }

    pub async fn retry(self: &Arc<Self>, selection: Selection) -> Result<Vec<Download>, FetchError> {
        let mut state = self.state.lock().await;
        let mut retried = Vec::new();
        for id in selection.resolve(&state.catalog) {
            let kind = match state.catalog.peek(id) {
                Some(download) if lifecycle::is_retryable(download.status) => {
                    Namespace::queued_event(&state, download)
                }
                _ => continue,
            };
            if let Some(download) = self.move_to(&mut state, id, Status::Queued, kind).await? {
                retried.push(download);
            }
        }
        self.admit(&mut state).await?;
        Ok(retried)
    }

    /// Remove rows from the catalog, deleting their files when `delete_file`
    pub async fn remove(
        self: &Arc<Self>,
        selection: Selection,
        delete_file: bool,
    ) -> Result<Vec<Download>, FetchError> {
        let mut state = self.state.lock().await;
        let mut removed = Vec::new();
        for id in selection.resolve(&state.catalog) {
            if let Some(download) = self.drop_download(&mut state, id, delete_file, true).await? {
                removed.push(download);
            }
        }
        self.admit(&mut state).await?;
        Ok(removed)
    }

    /// Pause everything running and stop admitting
    pub async fn freeze(&self) -> Result<bool, FetchError> {
        let mut state = self.state.lock().await;
        if state.scheduler.is_frozen() {
            return Ok(true);
        }

        state.scheduler.freeze();
        for id in state.transfers.running_ids() {
            if self
                .move_to(&mut state, id, Status::Paused, EventKind::Paused)
                .await?
                .is_some()
            {
                state.scheduler.remember_frozen(id);
            }
        }
        info!("Froze namespace {}", self.name);
        Ok(true)
    }

    /// Requeue what the freeze paused and admit again
    pub async fn unfreeze(self: &Arc<Self>) -> Result<bool, FetchError> {
        let mut state = self.state.lock().await;
        if !state.scheduler.is_frozen() {
            return Ok(true);
        }

        let ids = state.scheduler.unfreeze();
        for id in ids {
            if state.catalog.status_of(id) == Some(Status::Paused) {
                self.move_to(&mut state, id, Status::Queued, EventKind::Resumed)
                    .await?;
            }
        }
        info!("Unfroze namespace {}", self.name);
        self.admit(&mut state).await?;
        Ok(true)
    }

    pub async fn is_frozen(&self) -> bool {
        self.state.lock().await.scheduler.is_frozen()
    }

    /// Change how many transfers may run at once. Lowering the limit does
    /// not stop transfers that are already running.
    pub async fn set_concurrent_limit(self: &Arc<Self>, limit: i64) -> Result<(), FetchError> {
        let limit = u32::try_from(limit).map_err(|_| FetchError::InvalidConcurrentLimit(limit))?;
        let mut state = self.state.lock().await;
        state.scheduler.set_limit(limit);
        info!("Concurrent limit of {} set to {}", self.name, limit);
        self.admit(&mut state).await
    }

    pub async fn concurrent_limit(&self) -> u32 {
        self.state.lock().await.scheduler.limit()
    }

    pub async fn set_global_network_type(self: &Arc<Self>, network_type: Option<NetworkType>) -> Result<(), FetchError> {
        let mut state = self.state.lock().await;
        state.gate.set_global(network_type);
        self.enforce_network(&mut state).await?;
        self.admit(&mut state).await
    }

    /// Replace the request of a download. A new url or file restarts it from
    /// zero bytes, and is refused once the download has finished.
    pub async fn update_request(
        self: &Arc<Self>,
        id: Uuid,
        request: Request,
        notify: bool,
    ) -> Result<Option<Download>, FetchError> {
        validate_request(&request)?;
        let mut state = self.state.lock().await;
        let Some(existing) = state.catalog.get(id) else {
            return Ok(None);
        };
        if let Some(other) = state.catalog.find_by_file(&request.file) {
            if other.id != id {
                return Err(FetchError::DuplicateRequest(request.file));
            }
        }

        let relocated = request.url != existing.request.url || request.file != existing.request.file;
        if relocated && lifecycle::is_finished(existing.status) {
            return Err(FetchError::InvalidOperation(format!(
                "cannot move a {} download to a new url or file",
                existing.status
            )));
        }
        if relocated && existing.status == Status::Downloading {
            let kind = Namespace::queued_event(&state, &existing);
            self.move_to(&mut state, id, Status::Queued, kind).await?;
        }

        let Some(mut updated) = state.catalog.get(id) else {
            return Ok(None);
        };
        updated.request = Request { id, ..request };
        let updated = if relocated {
            updated.downloaded = 0;
            updated.total = None;
            state.catalog.save_with_blocks(updated, Vec::new()).await?
        } else {
            state.catalog.save(updated).await?
        };
        if state.scheduler.is_waiting(id) {
            state.scheduler.enqueue(&updated);
        }
        if notify {
            self.emit(EventKind::Updated, &updated);
        }

        self.admit(&mut state).await?;
        Ok(Some(updated))
    }

    pub async fn replace_extras(
        &self,
        id: Uuid,
        extras: HashMap<String, String>,
    ) -> Result<Option<Download>, FetchError> {
        let mut state = self.state.lock().await;
        let Some(mut download) = state.catalog.get(id) else {
            return Ok(None);
        };
        download.request.extras = extras;
        let download = state.catalog.save(download).await?;
        self.emit(EventKind::Updated, &download);
        Ok(Some(download))
    }

    /// Move the file of a completed download and record the new location
    pub async fn rename_completed_file(
        &self,
        id: Uuid,
        new_file: PathBuf,
    ) -> Result<Option<Download>, FetchError> {
        let mut state = self.state.lock().await;
        let Some(mut download) = state.catalog.get(id) else {
            return Ok(None);
        };
        if download.status != Status::Completed {
            return Err(FetchError::InvalidOperation(format!(
                "cannot rename the file of a {} download",
                download.status
            )));
        }
        if state.catalog.find_by_file(&new_file).is_some() {
            return Err(FetchError::DuplicateRequest(new_file));
        }
        if self.file_system.exists(&new_file).await {
            return Err(FetchError::InvalidOperation(format!(
                "{} already exists",
                new_file.display()
            )));
        }

        let old_file = download.request.file.clone();
        self.file_system.rename_file(&old_file, &new_file).await?;
        download.request.file = new_file.clone();
        let download = match state.catalog.save(download).await {
            Ok(download) => download,
            Err(e) => {
                if let Err(undo) = self.file_system.rename_file(&new_file, &old_file).await {
                    warn!("Failed to move {} back: {}", new_file.display(), undo);
                }
                return Err(e);
            }
        };
        self.emit(EventKind::Updated, &download);
        Ok(Some(download))
    }

    pub async fn reset_auto_retry_attempts(
        self: &Arc<Self>,
        id: Uuid,
        retry: bool,
    ) -> Result<Option<Download>, FetchError> {
        let mut state = self.state.lock().await;
        let Some(mut download) = state.catalog.get(id) else {
            return Ok(None);
        };
        download.auto_retry_attempts = 0;
        let mut download = state.catalog.save(download).await?;

        if retry && lifecycle::is_retryable(download.status) {
            let kind = Namespace::queued_event(&state, &download);
            if let Some(queued) = self.move_to(&mut state, id, Status::Queued, kind).await? {
                download = queued;
            }
            self.admit(&mut state).await?;
        }
        Ok(Some(download))
    }

    /// Attach a listener for `owner`, replaying the current state of every
    /// download to it first when asked to
    pub async fn attach_listener(
        &self,
        owner: u64,
        listener: Arc<dyn DownloadListener>,
        options: ListenerOptions,
    ) -> bool {
        let state = self.state.lock().await;
        if !self.fanout.attach(owner, Arc::clone(&listener)) {
            return false;
        }
        if options.notify_on_attach {
            let snapshot = state
                .catalog
                .all()
                .into_iter()
                .map(|d| DownloadEvent::new(EventKind::for_status(d.status), d));
            self.fanout.replay(listener.as_ref(), snapshot);
        }
        true
    }

    /// Run a read-only query against a consistent view of the namespace
    pub async fn read<T>(&self, query: impl FnOnce(&EngineState) -> T) -> T {
        let state = self.state.lock().await;
        query(&*state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DownloadDatabase;

    #[tokio::test]
    async fn test_next_free_file_skips_taken_names() {
        let db = Arc::new(DownloadDatabase::in_memory().await.unwrap());
        let mut catalog = Catalog::load(db).await.unwrap();
        for file in ["/data/movie.mkv", "/data/movie (1).mkv"] {
            let sequence = catalog.take_sequence();
            let mut download = Download::new(Request::new("https://example.com/m", file), "ns", sequence);
            download.status = Status::Added;
            catalog.save(download).await.unwrap();
        }

        assert_eq!(
            next_free_file(&catalog, Path::new("/data/movie.mkv")),
            PathBuf::from("/data/movie (2).mkv")
        );
        assert_eq!(
            next_free_file(&catalog, Path::new("/data/README")),
            PathBuf::from("/data/README (1)")
        );
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request(&Request::new("https://example.com/a", "/tmp/a")).is_ok());
        assert!(matches!(
            validate_request(&Request::new("not a url", "/tmp/a")),
            Err(FetchError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_request(&Request::new("https://example.com/a", "")),
            Err(FetchError::InvalidRequest(_))
        ));
    }
}
