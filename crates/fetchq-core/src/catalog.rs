//! Catalog store
//!
//! In-memory index over the persisted download rows. Every write reaches the
//! repository first and only then the in-memory copy, so a failed write
//! leaves the row exactly as it was. Reads hand out clones.

use crate::engine::DownloadRepository;
use crate::error::FetchError;
use fetchq_types::{Download, DownloadBlock, Status};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub(crate) struct Catalog {
    repository: Arc<dyn DownloadRepository>,
    downloads: HashMap<Uuid, Download>,
    blocks: HashMap<Uuid, Vec<DownloadBlock>>,
    next_sequence: u64,
}

impl Catalog {
    /// Load the catalog from its repository
    pub async fn load(repository: Arc<dyn DownloadRepository>) -> Result<Self, FetchError> {
        let rows = repository.load_all_downloads().await?;
        let blocks = repository.load_all_blocks().await?;
        let next_sequence = rows.iter().map(|d| d.sequence + 1).max().unwrap_or(0);

        Ok(Self {
            repository,
            downloads: rows.into_iter().map(|d| (d.id, d)).collect(),
            blocks,
            next_sequence,
        })
    }

    /// Hand out the next enqueue sequence number
    pub fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn get(&self, id: Uuid) -> Option<Download> {
        self.downloads.get(&id).cloned()
    }

    /// Borrow a row without cloning it
    pub fn peek(&self, id: Uuid) -> Option<&Download> {
        self.downloads.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.downloads.contains_key(&id)
    }

    pub fn status_of(&self, id: Uuid) -> Option<Status> {
        self.downloads.get(&id).map(|d| d.status)
    }

    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    /// All downloads in enqueue order
    pub fn all(&self) -> Vec<Download> {
        self.select(|_| true)
    }

    /// Downloads matching `predicate`, in enqueue order
    pub fn select(&self, predicate: impl Fn(&Download) -> bool) -> Vec<Download> {
        let mut selected: Vec<Download> = self
            .downloads
            .values()
            .filter(|d| predicate(d))
            .cloned()
            .collect();
        selected.sort_by_key(|d| (d.sequence, d.id));
        selected
    }

    /// Ids matching `predicate`, in enqueue order
    pub fn select_ids(&self, predicate: impl Fn(&Download) -> bool) -> Vec<Uuid> {
        self.select(predicate).into_iter().map(|d| d.id).collect()
    }

    /// The download that writes to `file`, if any
    pub fn find_by_file(&self, file: &Path) -> Option<Download> {
        self.downloads
            .values()
            .find(|d| d.request.file == file)
            .cloned()
    }

    pub fn blocks(&self, id: Uuid) -> Vec<DownloadBlock> {
        let mut blocks = self.blocks.get(&id).cloned().unwrap_or_default();
        blocks.sort_by_key(|b| b.position);
        blocks
    }

    /// Persist a whole row, then publish it in memory
    pub async fn save(&mut self, download: Download) -> Result<Download, FetchError> {
        self.repository.upsert_download(&download).await?;
        self.downloads.insert(download.id, download.clone());
        Ok(download)
    }

    /// Persist byte counters for a row
    pub async fn save_progress(
        &mut self,
        id: Uuid,
        downloaded: u64,
        total: Option<u64>,
    ) -> Result<Option<Download>, FetchError> {
        if !self.downloads.contains_key(&id) {
            return Ok(None);
        }

        self.repository.update_progress(id, downloaded, total).await?;
        Ok(self.downloads.get_mut(&id).map(|download| {
            download.downloaded = downloaded;
            download.total = total;
            download.clone()
        }))
    }

    /// Persist a row and replace its whole block set in one write
    pub async fn save_with_blocks(
        &mut self,
        download: Download,
        mut blocks: Vec<DownloadBlock>,
    ) -> Result<Download, FetchError> {
        blocks.sort_by_key(|b| b.position);
        self.repository
            .upsert_download_with_blocks(&download, &blocks)
            .await?;
        if blocks.is_empty() {
            self.blocks.remove(&download.id);
        } else {
            self.blocks.insert(download.id, blocks);
        }
        self.downloads.insert(download.id, download.clone());
        Ok(download)
    }

    /// Persist one block together with its row. The row's byte count becomes
    /// the sum of its blocks, so the two never disagree on disk.
    pub async fn save_block(&mut self, block: DownloadBlock) -> Result<Option<Download>, FetchError> {
        let Some(mut download) = self.get(block.download_id) else {
            return Ok(None);
        };
        let mut blocks = self.blocks(download.id);
        match blocks.iter_mut().find(|b| b.position == block.position) {
            Some(existing) => *existing = block,
            None => blocks.push(block),
        }
        download.downloaded = blocks.iter().map(|b| b.downloaded).sum();
        self.save_with_blocks(download, blocks).await.map(Some)
    }

    /// Drop a row and its blocks, returning the last snapshot
    pub async fn drop_row(&mut self, id: Uuid) -> Result<Option<Download>, FetchError> {
        if !self.downloads.contains_key(&id) {
            return Ok(None);
        }

        self.repository.delete_download(id).await?;
        self.blocks.remove(&id);
        Ok(self.downloads.remove(&id))
    }
}
