//! SQLite-based persistence layer for downloads
//!
//! Stores downloads and their blocks in a relational database so progress
//! survives a crash and a namespace can be reopened by a new engine instance.

use crate::error::FetchError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fetchq_types::{Download, DownloadBlock, Request};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Durable storage for download and block rows
#[async_trait]
pub trait DownloadRepository: Send + Sync {
    /// Insert or replace a download row
    async fn upsert_download(&self, download: &Download) -> Result<(), FetchError>;

    /// Insert or replace a download row together with its complete block set,
    /// in one transaction. Stored blocks missing from `blocks` are dropped.
    async fn upsert_download_with_blocks(
        &self,
        download: &Download,
        blocks: &[DownloadBlock],
    ) -> Result<(), FetchError>;

    /// Load every download of the namespace
    async fn load_all_downloads(&self) -> Result<Vec<Download>, FetchError>;

    /// Delete a download together with its blocks
    async fn delete_download(&self, id: Uuid) -> Result<(), FetchError>;

    /// Update transferred and expected byte counts
    async fn update_progress(
        &self,
        id: Uuid,
        downloaded: u64,
        total: Option<u64>,
    ) -> Result<(), FetchError>;

    /// Load all blocks grouped by download
    async fn load_all_blocks(&self) -> Result<HashMap<Uuid, Vec<DownloadBlock>>, FetchError>;
}

/// Database connection pool for download persistence
#[derive(Clone, Debug)]
pub struct DownloadDatabase {
    pool: SqlitePool,
}

impl DownloadDatabase {
    /// Open (or create) the database file at `db_path`. A location that cannot
    /// be created or opened is reported as [`FetchError::StorageUnavailable`].
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, FetchError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(path, e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| unavailable(path, e))?;
        Self::with_pool(pool).await
    }

    /// An in-memory database. A single connection is kept alive so every
    /// query sees the same data.
    pub async fn in_memory() -> Result<Self, FetchError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, FetchError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                url TEXT NOT NULL,
                file TEXT NOT NULL,
                group_id INTEGER NOT NULL DEFAULT 0,
                priority TEXT NOT NULL,
                network_type TEXT NOT NULL,
                tag TEXT,
                identifier INTEGER NOT NULL DEFAULT 0,
                headers TEXT NOT NULL,
                extras TEXT NOT NULL,
                enqueue_action TEXT NOT NULL,
                download_on_enqueue INTEGER NOT NULL DEFAULT 1,
                auto_retry_max_attempts INTEGER,
                status TEXT NOT NULL,
                downloaded INTEGER NOT NULL DEFAULT 0,
                total INTEGER,
                error TEXT,
                auto_retry_attempts INTEGER NOT NULL DEFAULT 0,
                sequence INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS blocks (
                download_id TEXT NOT NULL,
                block_position INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (download_id, block_position),
                FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
            CREATE INDEX IF NOT EXISTS idx_downloads_group ON downloads(group_id);
            CREATE INDEX IF NOT EXISTS idx_downloads_file ON downloads(file);
            CREATE INDEX IF NOT EXISTS idx_blocks_download ON blocks(download_id);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl DownloadRepository for DownloadDatabase {
    async fn upsert_download(&self, download: &Download) -> Result<(), FetchError> {
        let mut conn = self.pool.acquire().await?;
        write_download(&mut conn, download).await
    }

    async fn upsert_download_with_blocks(
        &self,
        download: &Download,
        blocks: &[DownloadBlock],
    ) -> Result<(), FetchError> {
        let mut tx = self.pool.begin().await?;

        write_download(&mut tx, download).await?;
        sqlx::query("DELETE FROM blocks WHERE download_id = ?")
            .bind(download.id.to_string())
            .execute(&mut *tx)
            .await?;
        for block in blocks {
            write_block(&mut tx, block).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_all_downloads(&self) -> Result<Vec<Download>, FetchError> {
        let rows = sqlx::query("SELECT * FROM downloads ORDER BY sequence ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_download).collect()
    }

    async fn delete_download(&self, id: Uuid) -> Result<(), FetchError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM blocks WHERE download_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_progress(
        &self,
        id: Uuid,
        downloaded: u64,
        total: Option<u64>,
    ) -> Result<(), FetchError> {
        sqlx::query("UPDATE downloads SET downloaded = ?, total = ? WHERE id = ?")
            .bind(downloaded as i64)
            .bind(total.map(|t| t as i64))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_all_blocks(&self) -> Result<HashMap<Uuid, Vec<DownloadBlock>>, FetchError> {
        let rows = sqlx::query("SELECT * FROM blocks ORDER BY download_id, block_position")
            .fetch_all(&self.pool)
            .await?;

        let mut blocks: HashMap<Uuid, Vec<DownloadBlock>> = HashMap::new();
        for row in rows {
            let block = row_to_block(&row)?;
            blocks.entry(block.download_id).or_default().push(block);
        }

        Ok(blocks)
    }
}

async fn write_download(conn: &mut SqliteConnection, download: &Download) -> Result<(), FetchError> {
    let request = &download.request;
    let headers = serde_json::to_string(&request.headers)?;
    let extras = serde_json::to_string(&request.extras)?;

    sqlx::query(
        r#"
        INSERT INTO downloads (
            id, namespace, url, file, group_id, priority, network_type, tag,
            identifier, headers, extras, enqueue_action, download_on_enqueue,
            auto_retry_max_attempts, status, downloaded, total, error,
            auto_retry_attempts, sequence, created_at, completed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            namespace = excluded.namespace,
            url = excluded.url,
            file = excluded.file,
            group_id = excluded.group_id,
            priority = excluded.priority,
            network_type = excluded.network_type,
            tag = excluded.tag,
            identifier = excluded.identifier,
            headers = excluded.headers,
            extras = excluded.extras,
            enqueue_action = excluded.enqueue_action,
            download_on_enqueue = excluded.download_on_enqueue,
            auto_retry_max_attempts = excluded.auto_retry_max_attempts,
            status = excluded.status,
            downloaded = excluded.downloaded,
            total = excluded.total,
            error = excluded.error,
            auto_retry_attempts = excluded.auto_retry_attempts,
            sequence = excluded.sequence,
            completed_at = excluded.completed_at
        "#,
    )
    .bind(download.id.to_string())
    .bind(&download.namespace)
    .bind(&request.url)
    .bind(request.file.to_string_lossy().to_string())
    .bind(request.group_id)
    .bind(request.priority.as_str())
    .bind(request.network_type.as_str())
    .bind(request.tag.as_ref())
    .bind(request.identifier)
    .bind(headers)
    .bind(extras)
    .bind(request.enqueue_action.as_str())
    .bind(request.download_on_enqueue)
    .bind(request.auto_retry_max_attempts.map(i64::from))
    .bind(download.status.as_str())
    .bind(download.downloaded as i64)
    .bind(download.total.map(|t| t as i64))
    .bind(download.error.as_ref())
    .bind(i64::from(download.auto_retry_attempts))
    .bind(download.sequence as i64)
    .bind(download.created_at.to_rfc3339())
    .bind(download.completed_at.map(|d| d.to_rfc3339()))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn write_block(conn: &mut SqliteConnection, block: &DownloadBlock) -> Result<(), FetchError> {
    sqlx::query(
        r#"
        INSERT INTO blocks (
            download_id, block_position, start_byte, end_byte, downloaded_bytes
        ) VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(block.download_id.to_string())
    .bind(i64::from(block.position))
    .bind(block.start as i64)
    .bind(block.end as i64)
    .bind(block.downloaded as i64)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn unavailable(path: &Path, error: impl std::fmt::Display) -> FetchError {
    FetchError::StorageUnavailable(format!("{}: {}", path.display(), error))
}

fn parse_uuid(value: &str) -> Result<Uuid, FetchError> {
    Uuid::parse_str(value).map_err(|e| FetchError::Serialization(e.to_string()))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, FetchError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FetchError::Serialization(e.to_string()))
}

fn row_to_block(row: &SqliteRow) -> Result<DownloadBlock, FetchError> {
    Ok(DownloadBlock {
        download_id: parse_uuid(&row.try_get::<String, _>("download_id")?)?,
        position: row.try_get::<i64, _>("block_position")? as u32,
        start: row.try_get::<i64, _>("start_byte")? as u64,
        end: row.try_get::<i64, _>("end_byte")? as u64,
        downloaded: row.try_get::<i64, _>("downloaded_bytes")? as u64,
    })
}

/// Convert a database row to a Download struct
fn row_to_download(row: SqliteRow) -> Result<Download, FetchError> {
    let id = parse_uuid(&row.try_get::<String, _>("id")?)?;

    let request = Request {
        id,
        url: row.try_get("url")?,
        file: PathBuf::from(row.try_get::<String, _>("file")?),
        priority: row.try_get::<String, _>("priority")?.parse()?,
        network_type: row.try_get::<String, _>("network_type")?.parse()?,
        group_id: row.try_get("group_id")?,
        tag: row.try_get("tag")?,
        identifier: row.try_get("identifier")?,
        headers: serde_json::from_str(&row.try_get::<String, _>("headers")?)?,
        extras: serde_json::from_str(&row.try_get::<String, _>("extras")?)?,
        enqueue_action: row.try_get::<String, _>("enqueue_action")?.parse()?,
        download_on_enqueue: row.try_get("download_on_enqueue")?,
        auto_retry_max_attempts: row
            .try_get::<Option<i64>, _>("auto_retry_max_attempts")?
            .map(|n| n as u32),
    };

    Ok(Download {
        id,
        namespace: row.try_get("namespace")?,
        request,
        status: row.try_get::<String, _>("status")?.parse()?,
        downloaded: row.try_get::<i64, _>("downloaded")? as u64,
        total: row.try_get::<Option<i64>, _>("total")?.map(|t| t as u64),
        error: row.try_get("error")?,
        auto_retry_attempts: row.try_get::<i64, _>("auto_retry_attempts")? as u32,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        completed_at: row
            .try_get::<Option<String>, _>("completed_at")?
            .map(|s| parse_timestamp(&s))
            .transpose()?,
    })
}
