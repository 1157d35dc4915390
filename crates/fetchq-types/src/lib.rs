//! Shared types for fetchq
//!
//! This crate contains the data structures exchanged between the download
//! engine, its collaborators and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Enumerations
// ============================================================================

/// Lifecycle status of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    None,
    Added,
    Queued,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
    Removed,
    Deleted,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::None,
        Status::Added,
        Status::Queued,
        Status::Downloading,
        Status::Paused,
        Status::Completed,
        Status::Cancelled,
        Status::Failed,
        Status::Removed,
        Status::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::None => "none",
            Status::Added => "added",
            Status::Queued => "queued",
            Status::Downloading => "downloading",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
            Status::Failed => "failed",
            Status::Removed => "removed",
            Status::Deleted => "deleted",
        }
    }

    /// Removed and deleted downloads no longer exist in the catalog.
    pub fn is_gone(&self) -> bool {
        matches!(self, Status::Removed | Status::Deleted)
    }

    /// Statuses from which a transfer will never start again on its own.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Cancelled | Status::Failed | Status::Removed | Status::Deleted
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError::new("status", s))
    }
}

/// Scheduling priority. Higher priorities are admitted first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err(ParseEnumError::new("priority", s)),
        }
    }
}

/// Network a transfer is allowed to run on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Any available network
    #[default]
    All,
    WifiOnly,
    Unmetered,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::All => "all",
            NetworkType::WifiOnly => "wifi_only",
            NetworkType::Unmetered => "unmetered",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(NetworkType::All),
            "wifi_only" => Ok(NetworkType::WifiOnly),
            "unmetered" => Ok(NetworkType::Unmetered),
            _ => Err(ParseEnumError::new("network type", s)),
        }
    }
}

/// How to resolve a request whose destination file is already tracked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueAction {
    /// Drop the existing download and start over with the new request
    #[default]
    Replace,
    /// Merge the request into the existing download, keeping its progress
    Update,
    /// Fail with a duplicate error
    ErrorIfExists,
    /// Store the request under the next free `name (n).ext` file
    IncrementFileName,
}

impl EnqueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueAction::Replace => "replace",
            EnqueueAction::Update => "update",
            EnqueueAction::ErrorIfExists => "error_if_exists",
            EnqueueAction::IncrementFileName => "increment_file_name",
        }
    }
}

impl FromStr for EnqueueAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(EnqueueAction::Replace),
            "update" => Ok(EnqueueAction::Update),
            "error_if_exists" => Ok(EnqueueAction::ErrorIfExists),
            "increment_file_name" => Ok(EnqueueAction::IncrementFileName),
            _ => Err(ParseEnumError::new("enqueue action", s)),
        }
    }
}

/// Error returned when a stored enum value cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ============================================================================
// Request Types
// ============================================================================

/// What a caller asks the engine to download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub url: String,
    pub file: PathBuf,
    pub priority: Priority,
    pub network_type: NetworkType,
    pub group_id: i32,
    pub tag: Option<String>,
    /// Opaque correlation value chosen by the caller
    pub identifier: i64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub extras: HashMap<String, String>,
    pub enqueue_action: EnqueueAction,
    /// When false the download is stored as `Added` and waits for a resume
    pub download_on_enqueue: bool,
    /// Overrides the engine-wide automatic retry budget
    pub auto_retry_max_attempts: Option<u32>,
}

impl Request {
    pub fn new(url: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            file: file.into(),
            priority: Priority::Normal,
            network_type: NetworkType::All,
            group_id: 0,
            tag: None,
            identifier: 0,
            headers: HashMap::new(),
            extras: HashMap::new(),
            enqueue_action: EnqueueAction::Replace,
            download_on_enqueue: true,
            auto_retry_max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_network_type(mut self, network_type: NetworkType) -> Self {
        self.network_type = network_type;
        self
    }

    pub fn with_group(mut self, group_id: i32) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_identifier(mut self, identifier: i64) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    pub fn with_enqueue_action(mut self, action: EnqueueAction) -> Self {
        self.enqueue_action = action;
        self
    }

    pub fn with_download_on_enqueue(mut self, start: bool) -> Self {
        self.download_on_enqueue = start;
        self
    }

    pub fn with_auto_retry_max_attempts(mut self, attempts: u32) -> Self {
        self.auto_retry_max_attempts = Some(attempts);
        self
    }
}

// ============================================================================
// Download Types
// ============================================================================

/// A catalogued download. Callers only ever hold snapshots of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub id: Uuid,
    pub namespace: String,
    /// The request this download was created from, with its resolved file
    pub request: Request,
    pub status: Status,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub error: Option<String>,
    #[serde(default)]
    pub auto_retry_attempts: u32,
    /// Enqueue order, used to keep equal priorities first-in first-out
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Download {
    pub fn new(request: Request, namespace: impl Into<String>, sequence: u64) -> Self {
        Self {
            id: request.id,
            namespace: namespace.into(),
            request,
            status: Status::None,
            downloaded: 0,
            total: None,
            error: None,
            auto_retry_attempts: 0,
            sequence,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn file(&self) -> &std::path::Path {
        &self.request.file
    }

    pub fn group_id(&self) -> i32 {
        self.request.group_id
    }

    pub fn priority(&self) -> Priority {
        self.request.priority
    }

    pub fn network_type(&self) -> NetworkType {
        self.request.network_type
    }

    /// Percentage in `0..=100`, or `None` while the total size is unknown
    pub fn progress(&self) -> Option<u8> {
        match self.total {
            Some(0) if self.status == Status::Completed => Some(100),
            Some(total) if total > 0 => {
                let percent = (self.downloaded.min(total) as f64 / total as f64) * 100.0;
                Some(percent.floor() as u8)
            }
            _ => None,
        }
    }
}

/// A byte range of a download, tracked so transfers can resume per block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadBlock {
    pub download_id: Uuid,
    pub position: u32,
    pub start: u64,
    /// Inclusive end offset
    pub end: u64,
    pub downloaded: u64,
}

impl DownloadBlock {
    pub fn new(download_id: Uuid, position: u32, start: u64, end: u64) -> Self {
        Self {
            download_id,
            position,
            start,
            end,
            downloaded: 0,
        }
    }

    /// Size of this block in bytes
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.len()
    }
}

/// A file that was downloaded outside the engine and should be catalogued
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedDownload {
    pub url: String,
    pub file: PathBuf,
    pub group_id: i32,
    pub file_byte_size: u64,
    pub identifier: i64,
    pub tag: Option<String>,
    #[serde(default)]
    pub extras: HashMap<String, String>,
    pub created: DateTime<Utc>,
}

impl CompletedDownload {
    pub fn new(url: impl Into<String>, file: impl Into<PathBuf>, file_byte_size: u64) -> Self {
        Self {
            url: url.into(),
            file: file.into(),
            group_id: 0,
            file_byte_size,
            identifier: 0,
            tag: None,
            extras: HashMap::new(),
            created: Utc::now(),
        }
    }
}

/// Aggregated view over the downloads sharing a group id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: i32,
    pub downloads: Vec<Download>,
    pub added: usize,
    pub queued: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
    /// Mean progress of the group's downloads with a known size
    pub progress: Option<u8>,
}

impl GroupSummary {
    pub fn from_downloads(group_id: i32, downloads: Vec<Download>) -> Self {
        let count = |status: Status| downloads.iter().filter(|d| d.status == status).count();
        let known: Vec<u64> = downloads
            .iter()
            .filter_map(|d| d.progress())
            .map(u64::from)
            .collect();
        let progress = if known.is_empty() {
            None
        } else {
            Some((known.iter().sum::<u64>() / known.len() as u64) as u8)
        };

        Self {
            group_id,
            added: count(Status::Added),
            queued: count(Status::Queued),
            downloading: count(Status::Downloading),
            paused: count(Status::Paused),
            completed: count(Status::Completed),
            cancelled: count(Status::Cancelled),
            failed: count(Status::Failed),
            progress,
            downloads,
        }
    }

    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// What happened to a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    Added,
    Queued { waiting_on_network: bool },
    Updated,
    Started,
    Progress,
    BlockUpdated { block: DownloadBlock },
    Paused,
    Resumed,
    Cancelled,
    Completed,
    Failed,
    Removed,
    Deleted,
}

impl EventKind {
    /// The event that describes a download currently sitting in `status`
    pub fn for_status(status: Status) -> Self {
        match status {
            Status::None | Status::Added => EventKind::Added,
            Status::Queued => EventKind::Queued {
                waiting_on_network: false,
            },
            Status::Downloading => EventKind::Started,
            Status::Paused => EventKind::Paused,
            Status::Completed => EventKind::Completed,
            Status::Cancelled => EventKind::Cancelled,
            Status::Failed => EventKind::Failed,
            Status::Removed => EventKind::Removed,
            Status::Deleted => EventKind::Deleted,
        }
    }
}

/// Event delivered to listeners and broadcast subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadEvent {
    pub kind: EventKind,
    pub download: Download,
}

impl DownloadEvent {
    pub fn new(kind: EventKind, download: Download) -> Self {
        Self { kind, download }
    }
}

/// Options passed when attaching a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerOptions {
    /// Replay one event per catalogued download before live events
    pub notify_on_attach: bool,
}

impl ListenerOptions {
    pub fn live_only() -> Self {
        Self {
            notify_on_attach: false,
        }
    }

    pub fn with_replay() -> Self {
        Self {
            notify_on_attach: true,
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Isolation boundary for the catalog
    pub namespace: String,
    /// Maximum number of downloads in `Downloading` at once
    pub concurrent_limit: u32,
    /// Directory holding `<namespace>.db`
    pub data_dir: PathBuf,
    /// Keep the catalog in memory only
    #[serde(default)]
    pub in_memory: bool,
    /// Overrides every download's own network requirement when set
    #[serde(default)]
    pub global_network_type: Option<NetworkType>,
    /// Automatic retries for requests that do not set their own budget
    #[serde(default)]
    pub auto_retry_max_attempts: u32,
    /// How often active transfers are checked against the network gate
    #[serde(default = "default_network_check_interval_ms")]
    pub network_check_interval_ms: u64,
    /// Capacity of the broadcast event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_network_check_interval_ms() -> u64 {
    1000
}

fn default_event_buffer() -> usize {
    1000
}

impl EngineConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// An in-memory configuration, handy for tests and short-lived engines
    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self {
            in_memory: true,
            ..Self::new(namespace)
        }
    }

    pub fn with_concurrent_limit(mut self, limit: u32) -> Self {
        self.concurrent_limit = limit;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_global_network_type(mut self, network_type: Option<NetworkType>) -> Self {
        self.global_network_type = network_type;
        self
    }

    pub fn with_auto_retry_max_attempts(mut self, attempts: u32) -> Self {
        self.auto_retry_max_attempts = attempts;
        self
    }

    pub fn with_network_check_interval_ms(mut self, interval_ms: u64) -> Self {
        self.network_check_interval_ms = interval_ms;
        self
    }

    /// Location of the SQLite catalog for this namespace
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db", self.namespace))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            concurrent_limit: 1,
            data_dir: dirs::data_dir()
                .map(|p| p.join("fetchq"))
                .unwrap_or_else(|| PathBuf::from(".fetchq")),
            in_memory: false,
            global_network_type: None,
            auto_retry_max_attempts: 0,
            network_check_interval_ms: default_network_check_interval_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}
