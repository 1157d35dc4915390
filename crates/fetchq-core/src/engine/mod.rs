//! Download engine internals
//!
//! - Persistence of rows and blocks (SQLite)
//! - Priority admission with a concurrency limit and freeze
//! - Network gating
//! - Transfers driven through a pluggable [`Transport`]
//! - Namespaces shared by every instance opened on the same name

mod control;
mod namespace;
mod network;
mod persistence;
mod scheduler;
mod transfer;

pub(crate) use control::Selection;
pub use control::EnqueueResult;
pub(crate) use namespace::{acquire, release, Namespace};
pub use network::{AlwaysConnected, Connectivity};
pub use persistence::*;
pub use transfer::{TransferContext, TransferOutcome, Transport};

use crate::fs::{FileSystem, TokioFileSystem};
use std::sync::Arc;

/// Pluggable pieces an engine is opened with.
///
/// Only the first instance of a namespace decides them; later instances on
/// the same name share what it chose.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub connectivity: Arc<dyn Connectivity>,
    pub file_system: Arc<dyn FileSystem>,
    /// Storage to use instead of the namespace's SQLite database
    pub repository: Option<Arc<dyn DownloadRepository>>,
}

impl Collaborators {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connectivity: Arc::new(AlwaysConnected),
            file_system: Arc::new(TokioFileSystem),
            repository: None,
        }
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_file_system(mut self, file_system: Arc<dyn FileSystem>) -> Self {
        self.file_system = file_system;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn DownloadRepository>) -> Self {
        self.repository = Some(repository);
        self
    }
}
