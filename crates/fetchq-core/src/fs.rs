//! File system collaborator used by delete, replace and rename operations

use crate::error::FetchError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Delete a file. A file that does not exist is not an error.
    async fn delete_file(&self, path: &Path) -> Result<(), FetchError>;

    async fn rename_file(&self, from: &Path, to: &Path) -> Result<(), FetchError>;

    async fn exists(&self, path: &Path) -> bool;
}

/// File system backed by `tokio::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioFileSystem;

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn delete_file(&self, path: &Path) -> Result<(), FetchError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename_file(&self, from: &Path, to: &Path) -> Result<(), FetchError> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}
