//! End-to-end behaviour of the download engine against a scripted transport

use async_trait::async_trait;
use fetchq_core::{
    Collaborators, Connectivity, DownloadDatabase, DownloadEngine, DownloadListener, DownloadRepository, FetchError,
    FileSystem, TransferContext, TransferOutcome, Transport,
};
use fetchq_types::{
    CompletedDownload, Download, DownloadBlock, DownloadEvent, EngineConfig, EnqueueAction, EventKind,
    ListenerOptions, NetworkType, Priority, Request, Status,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const TOTAL: u64 = 100;

/// Transport that moves 10 bytes, then holds the transfer open until the
/// test releases it or the engine interrupts it
#[derive(Default)]
struct ScriptedTransport {
    release_all: AtomicBool,
    released: Mutex<HashSet<Uuid>>,
    started: Mutex<Vec<Uuid>>,
    failures_left: AtomicU32,
    stop_short: AtomicBool,
}

impl ScriptedTransport {
    fn finishing() -> Arc<Self> {
        let transport = Self::default();
        transport.release_all.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    fn holding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn release(&self, id: Uuid) {
        self.released.lock().insert(id);
    }

    fn started(&self) -> Vec<Uuid> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn transfer(
        &self,
        download: Download,
        _blocks: Vec<DownloadBlock>,
        ctx: TransferContext,
    ) -> Result<TransferOutcome, FetchError> {
        let id = download.id;
        self.started.lock().push(id);

        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FetchError::Transport("connection reset".to_string()));
        }

        let downloaded = (download.downloaded + 10).min(TOTAL);
        ctx.report_progress(downloaded, Some(TOTAL)).await?;

        loop {
            if ctx.is_interrupted() {
                return Ok(TransferOutcome::Interrupted);
            }
            if self.release_all.load(Ordering::SeqCst) || self.released.lock().contains(&id) {
                if self.stop_short.load(Ordering::SeqCst) {
                    return Ok(TransferOutcome::Completed);
                }
                let mut block = DownloadBlock::new(id, 0, 0, TOTAL - 1);
                block.downloaded = TOTAL;
                ctx.report_block(block).await?;
                ctx.report_progress(TOTAL, Some(TOTAL)).await?;
                return Ok(TransferOutcome::Completed);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<DownloadEvent>>,
}

impl Recorder {
    fn kinds_for(&self, id: Uuid) -> Vec<EventKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.download.id == id)
            .map(|e| e.kind.clone())
            .collect()
    }
}

impl DownloadListener for Recorder {
    fn on_event(&self, event: &DownloadEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Mirrors statuses from events and remembers the most downloads ever
/// downloading at once
#[derive(Default)]
struct PeakWatcher {
    statuses: Mutex<HashMap<Uuid, Status>>,
    peak: AtomicUsize,
}

impl DownloadListener for PeakWatcher {
    fn on_event(&self, event: &DownloadEvent) {
        let mut statuses = self.statuses.lock();
        statuses.insert(event.download.id, event.download.status);
        let downloading = statuses
            .values()
            .filter(|s| **s == Status::Downloading)
            .count();
        self.peak.fetch_max(downloading, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingFs {
    deleted: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl FileSystem for RecordingFs {
    async fn delete_file(&self, path: &Path) -> Result<(), FetchError> {
        self.deleted.lock().push(path.to_path_buf());
        Ok(())
    }

    async fn rename_file(&self, _from: &Path, _to: &Path) -> Result<(), FetchError> {
        Ok(())
    }

    async fn exists(&self, _path: &Path) -> bool {
        false
    }
}

/// Wifi can be switched off; unrestricted networks are always up
#[derive(Default)]
struct WifiSwitch {
    wifi: AtomicBool,
}

impl Connectivity for WifiSwitch {
    fn is_available(&self, network_type: NetworkType) -> bool {
        network_type == NetworkType::All || self.wifi.load(Ordering::SeqCst)
    }
}

/// SQLite catalog whose writes start failing once their budget runs out
struct FlakyRepository {
    inner: DownloadDatabase,
    writes_left: AtomicU32,
}

impl FlakyRepository {
    async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DownloadDatabase::in_memory().await.unwrap(),
            writes_left: AtomicU32::new(u32::MAX),
        })
    }

    fn fail_after(&self, writes: u32) {
        self.writes_left.store(writes, Ordering::SeqCst);
    }

    fn spend(&self) -> Result<(), FetchError> {
        self.writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| FetchError::StorageUnavailable("disk full".to_string()))
    }

    async fn statuses(&self) -> HashMap<Uuid, Status> {
        self.inner
            .load_all_downloads()
            .await
            .unwrap()
            .into_iter()
            .map(|d| (d.id, d.status))
            .collect()
    }
}

#[async_trait]
impl DownloadRepository for FlakyRepository {
    async fn upsert_download(&self, download: &Download) -> Result<(), FetchError> {
        self.spend()?;
        self.inner.upsert_download(download).await
    }

    async fn upsert_download_with_blocks(
        &self,
        download: &Download,
        blocks: &[DownloadBlock],
    ) -> Result<(), FetchError> {
        self.spend()?;
        self.inner.upsert_download_with_blocks(download, blocks).await
    }

    async fn load_all_downloads(&self) -> Result<Vec<Download>, FetchError> {
        self.inner.load_all_downloads().await
    }

    async fn delete_download(&self, id: Uuid) -> Result<(), FetchError> {
        self.spend()?;
        self.inner.delete_download(id).await
    }

    async fn update_progress(
        &self,
        id: Uuid,
        downloaded: u64,
        total: Option<u64>,
    ) -> Result<(), FetchError> {
        self.spend()?;
        self.inner.update_progress(id, downloaded, total).await
    }

    async fn load_all_blocks(&self) -> Result<HashMap<Uuid, Vec<DownloadBlock>>, FetchError> {
        self.inner.load_all_blocks().await
    }
}

fn config(namespace: &str, limit: u32) -> EngineConfig {
    EngineConfig::in_memory(namespace)
        .with_concurrent_limit(limit)
        .with_network_check_interval_ms(10)
}

async fn open(namespace: &str, limit: u32, transport: Arc<ScriptedTransport>) -> DownloadEngine {
    DownloadEngine::open(config(namespace, limit), Collaborators::new(transport))
        .await
        .unwrap()
}

fn request(file: &str) -> Request {
    Request::new(format!("https://example.com/files{file}"), file)
}

async fn wait_for(engine: &DownloadEngine, id: Uuid, check: impl Fn(&Download) -> bool) -> Download {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(download) = engine.get_download(id).await.unwrap() {
                if check(&download) {
                    return download;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for download")
}

async fn wait_for_status(engine: &DownloadEngine, id: Uuid, status: Status) -> Download {
    wait_for(engine, id, |d| d.status == status).await
}

// ============================================================================
// Intake
// ============================================================================

#[tokio::test]
async fn test_enqueue_then_get_returns_request_fields() {
    let engine = open("it-roundtrip", 0, ScriptedTransport::holding()).await;
    let request = request("/tmp/rt/a.bin")
        .with_priority(Priority::High)
        .with_group(12)
        .with_tag("nightly")
        .with_header("Authorization", "token");

    let queued = engine.enqueue(request.clone()).await.unwrap();
    assert_eq!(queued.id, request.id);
    assert_eq!(queued.status, Status::Queued);

    let fetched = engine.get_download(request.id).await.unwrap().unwrap();
    assert_eq!(fetched.url(), request.url);
    assert_eq!(fetched.file(), request.file.as_path());
    assert_eq!(fetched.group_id(), 12);
    assert_eq!(fetched.priority(), Priority::High);
    assert_eq!(fetched.request.tag.as_deref(), Some("nightly"));
    assert_eq!(engine.get_downloads_by_tag("nightly").await.unwrap().len(), 1);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_enqueue_without_start_stays_added() {
    let engine = open("it-added", 1, ScriptedTransport::holding()).await;
    let added = engine
        .enqueue(request("/tmp/added/a.bin").with_download_on_enqueue(false))
        .await
        .unwrap();
    assert_eq!(added.status, Status::Added);
    assert!(!engine.has_active_downloads(false).await.unwrap());
    assert!(engine.has_active_downloads(true).await.unwrap());

    let resumed = engine.resume(added.id).await.unwrap().unwrap();
    assert_eq!(resumed.status, Status::Queued);
    wait_for_status(&engine, added.id, Status::Downloading).await;
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_error_if_exists_rejects_duplicate_file() {
    let engine = open("it-duplicate", 0, ScriptedTransport::holding()).await;
    engine.enqueue(request("/tmp/dup/a.bin")).await.unwrap();

    let result = engine
        .enqueue(request("/tmp/dup/a.bin").with_enqueue_action(EnqueueAction::ErrorIfExists))
        .await;
    assert!(matches!(result, Err(FetchError::DuplicateRequest(_))));
    assert_eq!(engine.get_downloads().await.unwrap().len(), 1);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_replace_keeps_one_row_with_second_request() {
    let fs = Arc::new(RecordingFs::default());
    let engine = DownloadEngine::open(
        config("it-replace", 0),
        Collaborators::new(ScriptedTransport::holding()).with_file_system(fs.clone()),
    )
    .await
    .unwrap();

    let first = engine.enqueue(request("/tmp/rep/a.bin")).await.unwrap();
    let second = request("/tmp/rep/a.bin")
        .with_priority(Priority::Low)
        .with_group(4);
    engine.enqueue(second.clone()).await.unwrap();

    let downloads = engine.get_downloads().await.unwrap();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].id, second.id);
    assert_eq!(downloads[0].priority(), Priority::Low);
    assert_eq!(downloads[0].group_id(), 4);
    assert!(engine.get_download(first.id).await.unwrap().is_none());
    assert_eq!(*fs.deleted.lock(), vec![PathBuf::from("/tmp/rep/a.bin")]);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_update_merges_into_existing_row() {
    let engine = open("it-update", 0, ScriptedTransport::holding()).await;
    let original = engine
        .enqueue(request("/tmp/upd/a.bin").with_priority(Priority::Low))
        .await
        .unwrap();
    engine.pause(original.id).await.unwrap();

    let merged = engine
        .enqueue(
            request("/tmp/upd/a.bin")
                .with_priority(Priority::High)
                .with_tag("merged")
                .with_enqueue_action(EnqueueAction::Update),
        )
        .await
        .unwrap();

    assert_eq!(merged.id, original.id);
    assert_eq!(merged.status, Status::Paused);
    assert_eq!(merged.priority(), Priority::High);
    assert_eq!(merged.request.tag.as_deref(), Some("merged"));
    assert_eq!(engine.get_downloads().await.unwrap().len(), 1);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_increment_file_name_keeps_both() {
    let engine = open("it-increment", 0, ScriptedTransport::holding()).await;
    engine.enqueue(request("/tmp/inc/a.bin")).await.unwrap();
    let second = engine
        .enqueue(request("/tmp/inc/a.bin").with_enqueue_action(EnqueueAction::IncrementFileName))
        .await
        .unwrap();

    assert_eq!(second.file(), Path::new("/tmp/inc/a (1).bin"));
    assert_eq!(engine.get_downloads().await.unwrap().len(), 2);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_enqueue_all_reports_each_request() {
    let engine = open("it-batch", 0, ScriptedTransport::holding()).await;
    let results = engine
        .enqueue_all(vec![
            request("/tmp/batch/a.bin"),
            Request::new("not a url", "/tmp/batch/b.bin"),
            request("/tmp/batch/c.bin"),
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(FetchError::InvalidRequest(_))));
    assert!(results[2].1.is_ok());
    assert_eq!(engine.get_downloads().await.unwrap().len(), 2);
    engine.close().await.unwrap();
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_higher_priority_is_admitted_first() {
    let transport = ScriptedTransport::holding();
    let engine = open("it-priority", 0, transport.clone()).await;
    let low = engine
        .enqueue(request("/tmp/prio/low.bin").with_priority(Priority::Low))
        .await
        .unwrap();
    let high = engine
        .enqueue(request("/tmp/prio/high.bin").with_priority(Priority::High))
        .await
        .unwrap();

    engine.set_concurrent_limit(1).await.unwrap();

    let high = engine.get_download(high.id).await.unwrap().unwrap();
    let low = engine.get_download(low.id).await.unwrap().unwrap();
    assert_eq!(high.status, Status::Downloading);
    assert_eq!(low.status, Status::Queued);

    transport.release(high.id);
    wait_for_status(&engine, high.id, Status::Completed).await;
    wait_for_status(&engine, low.id, Status::Downloading).await;
    assert_eq!(transport.started(), vec![high.id, low.id]);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_equal_priority_is_fifo() {
    let engine = open("it-fifo", 0, ScriptedTransport::holding()).await;
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        ids.push(engine.enqueue(request(&format!("/tmp/fifo/{name}"))).await.unwrap().id);
    }

    let mut events = engine.subscribe().unwrap();
    engine.set_concurrent_limit(3).await.unwrap();

    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.kind == EventKind::Started {
            started.push(event.download.id);
        }
    }
    assert_eq!(started, ids);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrency_limit_is_never_exceeded() {
    let watcher = Arc::new(PeakWatcher::default());
    let engine = open("it-limit", 2, ScriptedTransport::finishing()).await;
    engine
        .add_listener(watcher.clone(), ListenerOptions::live_only())
        .await
        .unwrap();

    let requests: Vec<Request> = (0..8).map(|n| request(&format!("/tmp/limit/{n}"))).collect();
    let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();
    engine.enqueue_all(requests).await.unwrap();

    for id in ids {
        let done = wait_for_status(&engine, id, Status::Completed).await;
        assert_eq!(done.downloaded, TOTAL);
        assert_eq!(done.total, Some(TOTAL));
    }
    assert!(watcher.peak.load(Ordering::SeqCst) <= 2);
    assert!(watcher.peak.load(Ordering::SeqCst) >= 1);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_zero_limit_keeps_running_transfers() {
    let transport = ScriptedTransport::holding();
    let engine = open("it-zero", 1, transport.clone()).await;
    let running = engine.enqueue(request("/tmp/zero/a.bin")).await.unwrap();
    let waiting = engine.enqueue(request("/tmp/zero/b.bin")).await.unwrap();
    wait_for_status(&engine, running.id, Status::Downloading).await;

    engine.set_concurrent_limit(0).await.unwrap();
    transport.release(running.id);
    wait_for_status(&engine, running.id, Status::Completed).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    let waiting = engine.get_download(waiting.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, Status::Queued);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_pause_then_resume_keeps_bytes() {
    let engine = open("it-pause", 1, ScriptedTransport::holding()).await;
    let download = engine.enqueue(request("/tmp/pause/a.bin")).await.unwrap();
    wait_for(&engine, download.id, |d| d.downloaded == 10).await;

    let paused = engine.pause(download.id).await.unwrap().unwrap();
    assert_eq!(paused.status, Status::Paused);
    assert_eq!(paused.downloaded, 10);

    let resumed = engine.resume(download.id).await.unwrap().unwrap();
    assert!(matches!(resumed.status, Status::Queued | Status::Downloading));
    assert_eq!(resumed.downloaded, 10);

    let continued = wait_for(&engine, download.id, |d| d.downloaded == 20).await;
    assert_eq!(continued.status, Status::Downloading);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_freeze_pauses_everything_and_unfreeze_readmits() {
    let transport = ScriptedTransport::holding();
    let engine = open("it-freeze", 2, transport.clone()).await;
    let requests: Vec<Request> = (0..3).map(|n| request(&format!("/tmp/freeze/{n}"))).collect();
    let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();
    engine.enqueue_all(requests).await.unwrap();
    wait_for_status(&engine, ids[1], Status::Downloading).await;

    assert!(engine.freeze().await.unwrap());
    assert!(engine.freeze().await.unwrap());
    assert!(engine.is_frozen().await.unwrap());
    assert_eq!(
        engine.get_downloads_with_status(Status::Paused).await.unwrap().len(),
        2
    );

    let late = engine.enqueue(request("/tmp/freeze/late")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(engine
        .get_downloads_with_status(Status::Downloading)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(engine.get_download(late.id).await.unwrap().unwrap().status, Status::Queued);

    assert!(engine.unfreeze().await.unwrap());
    assert!(engine.unfreeze().await.unwrap());
    assert!(!engine.is_frozen().await.unwrap());
    wait_for_status(&engine, ids[0], Status::Downloading).await;
    wait_for_status(&engine, ids[1], Status::Downloading).await;
    assert!(engine
        .get_downloads_with_status(Status::Paused)
        .await
        .unwrap()
        .is_empty());
    engine.close().await.unwrap();
}

// ============================================================================
// Control plane
// ============================================================================

#[tokio::test]
async fn test_cancel_completed_is_a_no_op() {
    let engine = open("it-cancel", 1, ScriptedTransport::finishing()).await;
    let download = engine.enqueue(request("/tmp/cancel/a.bin")).await.unwrap();
    wait_for_status(&engine, download.id, Status::Completed).await;

    assert!(engine.cancel(download.id).await.unwrap().is_none());
    assert!(engine.cancel_ids(vec![download.id]).await.unwrap().is_empty());
    assert!(engine.cancel_ids(vec![Uuid::new_v4()]).await.unwrap().is_empty());
    let unchanged = engine.get_download(download.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, Status::Completed);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_group_stops_running_and_queued() {
    let engine = open("it-cancel-group", 1, ScriptedTransport::holding()).await;
    let a = engine
        .enqueue(request("/tmp/cg/a.bin").with_group(3))
        .await
        .unwrap();
    let b = engine
        .enqueue(request("/tmp/cg/b.bin").with_group(3))
        .await
        .unwrap();
    let other = engine
        .enqueue(request("/tmp/cg/c.bin").with_group(9))
        .await
        .unwrap();
    wait_for_status(&engine, a.id, Status::Downloading).await;

    let cancelled = engine.cancel_group(3).await.unwrap();
    let mut cancelled_ids: Vec<Uuid> = cancelled.iter().map(|d| d.id).collect();
    cancelled_ids.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(cancelled_ids, expected);
    assert!(cancelled.iter().all(|d| d.status == Status::Cancelled));

    wait_for_status(&engine, other.id, Status::Downloading).await;
    let summary = engine.get_group(3).await.unwrap();
    assert_eq!(summary.cancelled, 2);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_removed_and_deleted_never_reappear() {
    let fs = Arc::new(RecordingFs::default());
    let engine = DownloadEngine::open(
        config("it-remove", 2),
        Collaborators::new(ScriptedTransport::finishing()).with_file_system(fs.clone()),
    )
    .await
    .unwrap();
    let kept = engine.enqueue(request("/tmp/rm/kept.bin")).await.unwrap();
    let deleted = engine.enqueue(request("/tmp/rm/deleted.bin")).await.unwrap();
    wait_for_status(&engine, kept.id, Status::Completed).await;
    wait_for_status(&engine, deleted.id, Status::Completed).await;

    let removed = engine.remove(kept.id).await.unwrap().unwrap();
    assert_eq!(removed.status, Status::Removed);
    let gone = engine.delete(deleted.id).await.unwrap().unwrap();
    assert_eq!(gone.status, Status::Deleted);

    assert!(engine.get_downloads().await.unwrap().is_empty());
    assert!(engine.remove(kept.id).await.unwrap().is_none());
    assert_eq!(*fs.deleted.lock(), vec![PathBuf::from("/tmp/rm/deleted.bin")]);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_remove_all_with_status_only_touches_matching_rows() {
    let engine = open("it-remove-status", 0, ScriptedTransport::holding()).await;
    let paused = engine.enqueue(request("/tmp/rs/a.bin")).await.unwrap();
    let queued = engine.enqueue(request("/tmp/rs/b.bin")).await.unwrap();
    engine.pause(paused.id).await.unwrap();

    let removed = engine.remove_all_with_status(Status::Paused).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].id, paused.id);

    let left = engine.get_downloads().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, queued.id);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_transfer_can_be_retried() {
    let transport = ScriptedTransport::finishing();
    transport.failures_left.store(1, Ordering::SeqCst);
    let engine = open("it-retry", 1, transport.clone()).await;
    let download = engine.enqueue(request("/tmp/retry/a.bin")).await.unwrap();

    let failed = wait_for_status(&engine, download.id, Status::Failed).await;
    assert!(failed.error.unwrap().contains("connection reset"));

    let retried = engine.retry(download.id).await.unwrap().unwrap();
    assert_eq!(retried.error, None);
    wait_for_status(&engine, download.id, Status::Completed).await;
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_retryable_failure_is_requeued_automatically() {
    let transport = ScriptedTransport::finishing();
    transport.failures_left.store(1, Ordering::SeqCst);
    let engine = DownloadEngine::open(
        config("it-auto-retry", 1).with_auto_retry_max_attempts(2),
        Collaborators::new(transport.clone()),
    )
    .await
    .unwrap();
    let download = engine.enqueue(request("/tmp/auto/a.bin")).await.unwrap();

    let done = wait_for_status(&engine, download.id, Status::Completed).await;
    assert_eq!(done.auto_retry_attempts, 1);
    assert_eq!(transport.started().len(), 2);

    let reset = engine
        .reset_auto_retry_attempts(download.id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reset.auto_retry_attempts, 0);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_short_completion_fails() {
    let transport = ScriptedTransport::finishing();
    transport.stop_short.store(true, Ordering::SeqCst);
    let engine = open("it-short", 1, transport).await;
    let download = engine.enqueue(request("/tmp/short/a.bin")).await.unwrap();

    let failed = wait_for_status(&engine, download.id, Status::Failed).await;
    assert_eq!(failed.downloaded, 10);
    assert!(failed.error.is_some());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_blocks_are_persisted() {
    let engine = open("it-blocks", 1, ScriptedTransport::finishing()).await;
    let download = engine.enqueue(request("/tmp/blocks/a.bin")).await.unwrap();
    wait_for_status(&engine, download.id, Status::Completed).await;

    let blocks = engine.get_download_blocks(download.id).await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].is_complete());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_add_completed_replaces_in_progress_download() {
    let fs = Arc::new(RecordingFs::default());
    let engine = DownloadEngine::open(
        config("it-completed", 1),
        Collaborators::new(ScriptedTransport::holding()).with_file_system(fs.clone()),
    )
    .await
    .unwrap();
    let running = engine.enqueue(request("/tmp/done/a.bin")).await.unwrap();
    wait_for_status(&engine, running.id, Status::Downloading).await;

    let adopted = engine
        .add_completed_download(
            CompletedDownload::new("https://example.com/files/tmp/done/a.bin", "/tmp/done/a.bin", 500),
            true,
        )
        .await
        .unwrap();

    assert_eq!(adopted.status, Status::Completed);
    assert_eq!(adopted.total, Some(500));
    let downloads = engine.get_downloads().await.unwrap();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].id, adopted.id);
    assert_eq!(downloads[0].file(), Path::new("/tmp/done/a.bin"));
    assert!(fs.deleted.lock().is_empty());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_update_request_restarts_relocated_download() {
    let recorder = Arc::new(Recorder::default());
    let engine = open("it-update-request", 0, ScriptedTransport::holding()).await;
    engine
        .add_listener(recorder.clone(), ListenerOptions::live_only())
        .await
        .unwrap();
    let download = engine.enqueue(request("/tmp/ur/a.bin")).await.unwrap();

    let updated = engine
        .update_request(download.id, request("/tmp/ur/b.bin").with_priority(Priority::High), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.id, download.id);
    assert_eq!(updated.file(), Path::new("/tmp/ur/b.bin"));
    assert_eq!(updated.downloaded, 0);
    assert_eq!(updated.status, Status::Queued);
    assert!(recorder.kinds_for(download.id).contains(&EventKind::Updated));

    let mut extras = HashMap::new();
    extras.insert("checksum".to_string(), "abc".to_string());
    let replaced = engine
        .replace_extras(download.id, extras.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replaced.request.extras, extras);
    assert!(engine
        .update_request(Uuid::new_v4(), request("/tmp/ur/c.bin"), false)
        .await
        .unwrap()
        .is_none());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_finished_download_cannot_be_relocated() {
    let engine = open("it-relocate-finished", 0, ScriptedTransport::holding()).await;
    let completed = engine
        .add_completed_download(
            CompletedDownload::new("https://example.com/files/tmp/fin/a.bin", "/tmp/fin/a.bin", 500),
            false,
        )
        .await
        .unwrap();

    let err = engine
        .update_request(
            completed.id,
            Request::new("https://example.com/files/tmp/fin/b.bin", "/tmp/fin/b.bin"),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidOperation(_)), "{err:?}");

    let unchanged = engine.get_download(completed.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, Status::Completed);
    assert_eq!(unchanged.downloaded, 500);
    assert_eq!(unchanged.total, Some(500));
    assert_eq!(unchanged.file(), Path::new("/tmp/fin/a.bin"));

    // Settings that leave url and file alone still apply
    let tagged = engine
        .update_request(completed.id, unchanged.request.clone().with_tag("archived"), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tagged.status, Status::Completed);
    assert_eq!(tagged.request.tag.as_deref(), Some("archived"));
    assert_eq!(tagged.downloaded, 500);

    let cancelled = engine.enqueue(request("/tmp/fin/c.bin")).await.unwrap();
    engine.cancel(cancelled.id).await.unwrap();
    assert!(engine
        .update_request(cancelled.id, request("/tmp/fin/d.bin"), false)
        .await
        .is_err());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_rename_refuses_an_existing_target() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.bin");
    let taken = dir.path().join("taken.bin");
    std::fs::write(&source, b"payload").unwrap();
    std::fs::write(&taken, b"other").unwrap();

    let engine = open("it-rename", 0, ScriptedTransport::holding()).await;
    let completed = engine
        .add_completed_download(CompletedDownload::new("https://example.com/a.bin", &source, 7), false)
        .await
        .unwrap();

    let err = engine
        .rename_completed_file(completed.id, &taken)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidOperation(_)), "{err:?}");
    assert_eq!(std::fs::read(&taken).unwrap(), b"other");
    assert!(source.exists());

    let moved = dir.path().join("moved").join("a.bin");
    let renamed = engine
        .rename_completed_file(completed.id, &moved)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.file(), moved.as_path());
    assert!(moved.exists());
    assert!(!source.exists());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_add_completed_skips_invalid_entries() {
    let engine = open("it-completed-batch", 0, ScriptedTransport::holding()).await;
    let added = engine
        .add_completed_downloads(
            vec![
                CompletedDownload::new("https://example.com/ok", "/tmp/cb/ok.bin", 10),
                CompletedDownload::new("not a url", "/tmp/cb/bad.bin", 10),
                CompletedDownload::new("https://example.com/ok2", "/tmp/cb/ok2.bin", 20),
            ],
            false,
        )
        .await
        .unwrap();

    let files: Vec<&Path> = added.iter().map(|d| d.file()).collect();
    assert_eq!(files, vec![Path::new("/tmp/cb/ok.bin"), Path::new("/tmp/cb/ok2.bin")]);
    assert_eq!(engine.get_downloads().await.unwrap().len(), 2);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_quiet_add_completed_stays_quiet_when_replacing() {
    let recorder = Arc::new(Recorder::default());
    let engine = open("it-completed-quiet", 0, ScriptedTransport::holding()).await;
    let queued = engine.enqueue(request("/tmp/quiet/a.bin")).await.unwrap();
    engine
        .add_listener(recorder.clone(), ListenerOptions::live_only())
        .await
        .unwrap();

    let adopted = engine
        .add_completed_download(
            CompletedDownload::new("https://example.com/files/tmp/quiet/a.bin", "/tmp/quiet/a.bin", 5),
            false,
        )
        .await
        .unwrap();

    assert!(engine.get_download(queued.id).await.unwrap().is_none());
    assert!(recorder.kinds_for(queued.id).is_empty());
    assert!(recorder.kinds_for(adopted.id).is_empty());
    engine.close().await.unwrap();
}

// ============================================================================
// Network gate
// ============================================================================

#[tokio::test]
async fn test_network_requirement_holds_and_pauses_transfers() {
    let network = Arc::new(WifiSwitch::default());
    let recorder = Arc::new(Recorder::default());
    let engine = DownloadEngine::open(
        config("it-network", 1),
        Collaborators::new(ScriptedTransport::holding()).with_connectivity(network.clone()),
    )
    .await
    .unwrap();
    engine
        .add_listener(recorder.clone(), ListenerOptions::live_only())
        .await
        .unwrap();

    let download = engine
        .enqueue(request("/tmp/net/a.bin").with_network_type(NetworkType::WifiOnly))
        .await
        .unwrap();
    assert_eq!(download.status, Status::Queued);
    assert!(recorder.kinds_for(download.id).contains(&EventKind::Queued {
        waiting_on_network: true
    }));

    network.wifi.store(true, Ordering::SeqCst);
    wait_for_status(&engine, download.id, Status::Downloading).await;

    network.wifi.store(false, Ordering::SeqCst);
    let paused = wait_for_status(&engine, download.id, Status::Paused).await;
    assert_eq!(paused.error, None);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_global_override_changes_evaluation_only() {
    let engine = DownloadEngine::open(
        config("it-override", 1),
        Collaborators::new(ScriptedTransport::holding()).with_connectivity(Arc::new(WifiSwitch::default())),
    )
    .await
    .unwrap();
    let download = engine
        .enqueue(request("/tmp/ovr/a.bin").with_network_type(NetworkType::WifiOnly))
        .await
        .unwrap();

    engine
        .set_global_network_type(Some(NetworkType::All))
        .await
        .unwrap();
    let running = engine.get_download(download.id).await.unwrap().unwrap();
    assert_eq!(running.status, Status::Downloading);
    assert_eq!(running.network_type(), NetworkType::WifiOnly);

    engine
        .set_global_network_type(Some(NetworkType::WifiOnly))
        .await
        .unwrap();
    let paused = engine.get_download(download.id).await.unwrap().unwrap();
    assert_eq!(paused.status, Status::Paused);
    engine.close().await.unwrap();
}

// ============================================================================
// Listeners
// ============================================================================

#[tokio::test]
async fn test_listener_replay_and_duplicates() {
    let engine = open("it-replay", 0, ScriptedTransport::holding()).await;
    let first = engine.enqueue(request("/tmp/replay/a.bin")).await.unwrap();
    let second = engine.enqueue(request("/tmp/replay/b.bin")).await.unwrap();
    engine.pause(first.id).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn DownloadListener> = recorder.clone();
    assert!(engine
        .add_listener(listener.clone(), ListenerOptions::with_replay())
        .await
        .unwrap());
    assert!(!engine
        .add_listener(listener.clone(), ListenerOptions::with_replay())
        .await
        .unwrap());
    assert_eq!(engine.listener_count().await.unwrap(), 1);

    let replayed: Vec<(Uuid, EventKind)> = recorder
        .events
        .lock()
        .iter()
        .map(|e| (e.download.id, e.kind.clone()))
        .collect();
    assert_eq!(
        replayed,
        vec![
            (first.id, EventKind::Paused),
            (
                second.id,
                EventKind::Queued {
                    waiting_on_network: false
                }
            ),
        ]
    );

    assert!(engine.remove_listener(&listener).await.unwrap());
    engine.cancel(second.id).await.unwrap();
    assert_eq!(recorder.events.lock().len(), 2);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_panicking_listener_is_isolated() {
    let engine = open("it-panic", 0, ScriptedTransport::holding()).await;
    let recorder = Arc::new(Recorder::default());
    engine
        .add_listener(
            Arc::new(|_: &DownloadEvent| panic!("listener failure")),
            ListenerOptions::live_only(),
        )
        .await
        .unwrap();
    engine
        .add_listener(recorder.clone(), ListenerOptions::live_only())
        .await
        .unwrap();

    let download = engine.enqueue(request("/tmp/panic/a.bin")).await.unwrap();
    assert_eq!(
        recorder.kinds_for(download.id),
        vec![
            EventKind::Added,
            EventKind::Queued {
                waiting_on_network: false
            }
        ]
    );
    assert_eq!(
        engine.get_download(download.id).await.unwrap().unwrap().status,
        Status::Queued
    );
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_subscribers_see_lifecycle_events() {
    let engine = open("it-subscribe", 1, ScriptedTransport::finishing()).await;
    let mut events = engine.subscribe().unwrap();
    let download = engine.enqueue(request("/tmp/sub/a.bin")).await.unwrap();
    wait_for_status(&engine, download.id, Status::Completed).await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event.kind, EventKind::Progress | EventKind::BlockUpdated { .. }) {
            kinds.push(event.kind);
        }
    }
    assert_eq!(
        kinds,
        vec![
            EventKind::Added,
            EventKind::Queued {
                waiting_on_network: false
            },
            EventKind::Started,
            EventKind::Completed,
        ]
    );
    engine.close().await.unwrap();
}

// ============================================================================
// Storage failures
// ============================================================================

async fn open_flaky(namespace: &str, repository: Arc<FlakyRepository>) -> DownloadEngine {
    DownloadEngine::open(
        config(namespace, 0),
        Collaborators::new(ScriptedTransport::holding()).with_repository(repository),
    )
    .await
    .unwrap()
}

async fn enqueue_three(engine: &DownloadEngine, dir: &str) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let download = engine
            .enqueue(request(&format!("/tmp/{dir}/{name}.bin")))
            .await
            .unwrap();
        ids.push(download.id);
    }
    ids
}

#[tokio::test]
async fn test_cancel_batch_keeps_committed_prefix_on_storage_failure() {
    let repository = FlakyRepository::new().await;
    let engine = open_flaky("it-storage-cancel", repository.clone()).await;
    let ids = enqueue_three(&engine, "sc").await;

    repository.fail_after(1);
    let err = engine.cancel_ids(ids.clone()).await.unwrap_err();
    assert!(err.is_storage_failure(), "{err:?}");

    let expected = [Status::Cancelled, Status::Queued, Status::Queued];
    let persisted = repository.statuses().await;
    for (id, status) in ids.iter().zip(expected) {
        let download = engine.get_download(*id).await.unwrap().unwrap();
        assert_eq!(download.status, status);
        assert_eq!(persisted[id], status);
    }

    repository.fail_after(u32::MAX);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_remove_batch_keeps_committed_prefix_on_storage_failure() {
    let repository = FlakyRepository::new().await;
    let engine = open_flaky("it-storage-remove", repository.clone()).await;
    let ids = enqueue_three(&engine, "sr").await;

    repository.fail_after(1);
    assert!(engine.remove_ids(ids.clone()).await.is_err());

    let persisted = repository.statuses().await;
    assert!(engine.get_download(ids[0]).await.unwrap().is_none());
    assert!(!persisted.contains_key(&ids[0]));
    for id in &ids[1..] {
        assert_eq!(engine.get_download(*id).await.unwrap().unwrap().status, Status::Queued);
        assert_eq!(persisted[id], Status::Queued);
    }

    repository.fail_after(u32::MAX);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_intake_fails_only_when_storage_fails() {
    let repository = FlakyRepository::new().await;
    let engine = open_flaky("it-storage-intake", repository.clone()).await;

    repository.fail_after(1);
    let err = engine
        .add_completed_downloads(
            vec![
                CompletedDownload::new("https://example.com/1", "/tmp/si/1.bin", 1),
                CompletedDownload::new("https://example.com/2", "/tmp/si/2.bin", 2),
            ],
            false,
        )
        .await
        .unwrap_err();
    assert!(err.is_storage_failure(), "{err:?}");

    let committed = engine.get_downloads().await.unwrap();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].file(), Path::new("/tmp/si/1.bin"));
    assert_eq!(repository.statuses().await.len(), 1);

    repository.fail_after(u32::MAX);
    engine.close().await.unwrap();
}

// ============================================================================
// Instances and namespaces
// ============================================================================

#[tokio::test]
async fn test_closed_instance_returns_engine_closed() {
    let engine = open("it-closed", 0, ScriptedTransport::holding()).await;
    let clone = engine.clone();
    engine.close().await.unwrap();

    assert!(clone.is_closed());
    assert!(matches!(
        clone.enqueue(request("/tmp/closed/a.bin")).await,
        Err(FetchError::EngineClosed)
    ));
    assert!(matches!(clone.freeze().await, Err(FetchError::EngineClosed)));
}

#[tokio::test]
async fn test_instances_share_a_namespace() {
    let transport = ScriptedTransport::holding();
    let first = open("it-shared", 0, transport.clone()).await;
    let second = open("it-shared", 5, transport).await;
    let recorder = Arc::new(Recorder::default());
    second
        .add_listener(recorder.clone(), ListenerOptions::live_only())
        .await
        .unwrap();

    let download = first.enqueue(request("/tmp/shared/a.bin")).await.unwrap();
    assert_eq!(
        second.get_download(download.id).await.unwrap().map(|d| d.id),
        Some(download.id)
    );
    assert_eq!(second.concurrent_limit().await.unwrap(), 0);
    assert!(recorder.kinds_for(download.id).contains(&EventKind::Added));

    first.close().await.unwrap();
    assert!(matches!(first.get_downloads().await, Err(FetchError::EngineClosed)));
    assert_eq!(second.get_downloads().await.unwrap().len(), 1);
    assert_eq!(second.namespace(), "it-shared");
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_interrupted_rows_are_requeued_on_open() {
    let db = Arc::new(DownloadDatabase::in_memory().await.unwrap());
    let mut stale = Download::new(request("/tmp/crash/a.bin"), "it-crash", 0);
    stale.status = Status::Downloading;
    stale.downloaded = 40;
    db.upsert_download(&stale).await.unwrap();

    let engine = DownloadEngine::open(
        config("it-crash", 0),
        Collaborators::new(ScriptedTransport::holding()).with_repository(db.clone()),
    )
    .await
    .unwrap();
    let recovered = engine.get_download(stale.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, Status::Queued);
    assert_eq!(recovered.downloaded, 40);

    let persisted = db.load_all_downloads().await.unwrap();
    assert_eq!(persisted[0].status, Status::Queued);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_default_instance_registry() {
    assert!(matches!(
        DownloadEngine::default_instance().await,
        Err(FetchError::NotConfigured)
    ));

    DownloadEngine::set_default_config(
        config("it-default", 0),
        Collaborators::new(ScriptedTransport::holding()),
    )
    .await;
    let first = DownloadEngine::default_instance().await.unwrap();
    let again = DownloadEngine::default_instance().await.unwrap();
    let download = first.enqueue(request("/tmp/default/a.bin")).await.unwrap();
    assert!(again.get_download(download.id).await.unwrap().is_some());

    again.close().await.unwrap();
    assert!(first.is_closed());

    let reopened = DownloadEngine::default_instance().await.unwrap();
    assert!(!reopened.is_closed());
    assert_eq!(reopened.namespace(), "it-default");
    reopened.close().await.unwrap();
}
