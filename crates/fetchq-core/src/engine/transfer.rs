//! Transfers
//!
//! The engine never moves bytes itself. A [`Transport`] does, and reports
//! back through its [`TransferContext`]. This module also tracks which
//! transfers are running and which ones were interrupted but have not
//! returned yet.

use crate::engine::namespace::Namespace;
use crate::error::FetchError;
use async_trait::async_trait;
use fetchq_types::{Download, DownloadBlock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// How a transfer ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// All bytes are on disk
    Completed,
    /// The transfer noticed [`TransferContext::is_interrupted`] and stopped
    Interrupted,
}

/// Moves the bytes of one download.
///
/// `blocks` is the layout persisted by earlier attempts, so a transport can
/// resume where it stopped. Errors that [`FetchError::is_retryable`] accepts
/// are retried while the download has automatic attempts left.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transfer(
        &self,
        download: Download,
        blocks: Vec<DownloadBlock>,
        ctx: TransferContext,
    ) -> Result<TransferOutcome, FetchError>;
}

/// Handle a transport uses to observe interruption and report progress
#[derive(Clone)]
pub struct TransferContext {
    download_id: Uuid,
    token: u64,
    interrupted: Arc<AtomicBool>,
    namespace: Weak<Namespace>,
}

impl TransferContext {
    pub(crate) fn new(
        download_id: Uuid,
        token: u64,
        interrupted: Arc<AtomicBool>,
        namespace: Weak<Namespace>,
    ) -> Self {
        Self {
            download_id,
            token,
            interrupted,
            namespace,
        }
    }

    pub fn download_id(&self) -> Uuid {
        self.download_id
    }

    /// True once the engine paused, cancelled, removed or otherwise stopped
    /// this download. The transport should return promptly.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Persist byte counters and emit a progress event.
    ///
    /// Reports from an interrupted transfer are ignored.
    pub async fn report_progress(&self, downloaded: u64, total: Option<u64>) -> Result<(), FetchError> {
        let namespace = self.namespace.upgrade().ok_or(FetchError::EngineClosed)?;
        namespace
            .record_progress(self.download_id, self.token, downloaded, total)
            .await
    }

    /// Persist the state of one block and emit a block event
    pub async fn report_block(&self, block: DownloadBlock) -> Result<(), FetchError> {
        let namespace = self.namespace.upgrade().ok_or(FetchError::EngineClosed)?;
        namespace
            .record_block(self.download_id, self.token, block)
            .await
    }
}

struct Running {
    token: u64,
    interrupted: Arc<AtomicBool>,
}

/// Running and draining transfers of one namespace.
///
/// A download is running while its status is DOWNLOADING. Once interrupted
/// it is draining until its transport returns, and may not be started again
/// before that.
#[derive(Default)]
pub(crate) struct Transfers {
    next_token: u64,
    running: HashMap<Uuid, Running>,
    draining: HashMap<Uuid, u64>,
}

impl Transfers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new transfer, returning its token and interruption flag
    pub fn register(&mut self, id: Uuid) -> (u64, Arc<AtomicBool>) {
        self.next_token += 1;
        let interrupted = Arc::new(AtomicBool::new(false));
        self.running.insert(
            id,
            Running {
                token: self.next_token,
                interrupted: Arc::clone(&interrupted),
            },
        );
        (self.next_token, interrupted)
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn running_ids(&self) -> Vec<Uuid> {
        self.running.keys().copied().collect()
    }

    /// Running or still draining
    pub fn is_busy(&self, id: Uuid) -> bool {
        self.running.contains_key(&id) || self.draining.contains_key(&id)
    }

    /// Whether `token` is the live transfer of `id`
    pub fn is_current(&self, id: Uuid, token: u64) -> bool {
        self.running.get(&id).is_some_and(|r| r.token == token)
    }

    /// Signal a running transfer to stop. Returns false if none was running.
    pub fn interrupt(&mut self, id: Uuid) -> bool {
        match self.running.remove(&id) {
            Some(running) => {
                running.interrupted.store(true, Ordering::SeqCst);
                self.draining.insert(id, running.token);
                true
            }
            None => false,
        }
    }

    /// Record that the transfer `token` of `id` returned. Returns true if it
    /// was still the live transfer, false if it had been interrupted.
    pub fn finish(&mut self, id: Uuid, token: u64) -> bool {
        if self.is_current(id, token) {
            self.running.remove(&id);
            return true;
        }
        if self.draining.get(&id) == Some(&token) {
            self.draining.remove(&id);
        }
        false
    }

    /// Interrupt everything, returning the ids that were running
    pub fn interrupt_all(&mut self) -> Vec<Uuid> {
        let ids = self.running_ids();
        for id in &ids {
            self.interrupt(*id);
        }
        ids
    }
}
