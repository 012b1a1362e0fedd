use crate::models::{VisitLogStats, VisitRecord};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (create files or tables, counter starts at 0)
    async fn init(&self) -> Result<()>;

    /// Short backend name for logs and diagnostics
    fn backend_name(&self) -> &'static str;

    /// Current counter value; an absent counter reads as 0
    async fn load_count(&self) -> StorageResult<u64>;

    /// Atomically add one to the counter and return the new value
    async fn increment_count(&self) -> StorageResult<u64>;

    /// Overwrite the counter (manual correction only)
    async fn set_count(&self, value: u64) -> StorageResult<()>;

    /// Timestamp of the newest record for `visitor_id` with
    /// `now - visited_at < window_secs`, if any
    async fn latest_live_visit(
        &self,
        visitor_id: &str,
        now: i64,
        window_secs: i64,
    ) -> StorageResult<Option<i64>>;

    /// Whether `visitor_id` was counted within the window
    async fn has_live_visit(
        &self,
        visitor_id: &str,
        now: i64,
        window_secs: i64,
    ) -> StorageResult<bool> {
        Ok(self
            .latest_live_visit(visitor_id, now, window_secs)
            .await?
            .is_some())
    }

    /// Append a visit record to the log
    async fn append_visit(&self, record: &VisitRecord) -> StorageResult<()>;

    /// Drop expired (and unreadable) records, returning how many were removed
    async fn purge_visits(&self, now: i64, window_secs: i64) -> StorageResult<u64>;

    /// Count total, live and malformed visit log entries
    async fn visit_log_stats(&self, now: i64, window_secs: i64) -> StorageResult<VisitLogStats>;
}
