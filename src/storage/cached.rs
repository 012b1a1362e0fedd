use crate::models::{VisitLogStats, VisitRecord};
use crate::storage::{Storage, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Storage wrapper that remembers recent visitors so repeat visits skip the log scan
///
/// The cache only ever answers "yes, still live". Liveness is judged against
/// the caller's `now` and the cached record timestamp, never the cache's own
/// TTL, which only bounds memory.
pub struct CachedStorage {
    /// Underlying storage implementation
    inner: Arc<dyn Storage>,
    /// Latest counted visit per visitor id (Moka cache)
    last_seen: Cache<String, i64>,
}

impl CachedStorage {
    /// Upper bound on entry lifetime; moka rejects very long TTLs
    pub const MAX_TTL_SECS: i64 = 365 * 86_400;

    pub fn new(inner: Arc<dyn Storage>, max_entries: u64, window_secs: i64) -> Self {
        let ttl = Duration::from_secs(window_secs.clamp(1, Self::MAX_TTL_SECS) as u64);
        let last_seen = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { inner, last_seen }
    }

    /// Number of visitors currently cached
    pub async fn cached_visitors(&self) -> u64 {
        self.last_seen.run_pending_tasks().await;
        self.last_seen.entry_count()
    }
}

#[async_trait]
impl Storage for CachedStorage {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn load_count(&self) -> StorageResult<u64> {
        self.inner.load_count().await
    }

    async fn increment_count(&self) -> StorageResult<u64> {
        self.inner.increment_count().await
    }

    async fn set_count(&self, value: u64) -> StorageResult<()> {
        self.inner.set_count(value).await
    }

    async fn latest_live_visit(
        &self,
        visitor_id: &str,
        now: i64,
        window_secs: i64,
    ) -> StorageResult<Option<i64>> {
        if let Some(visited_at) = self.last_seen.get(visitor_id).await {
            if now.saturating_sub(visited_at) < window_secs {
                return Ok(Some(visited_at));
            }
        }

        let latest = self
            .inner
            .latest_live_visit(visitor_id, now, window_secs)
            .await?;
        if let Some(visited_at) = latest {
            self.last_seen
                .insert(visitor_id.to_string(), visited_at)
                .await;
        }
        Ok(latest)
    }

    async fn append_visit(&self, record: &VisitRecord) -> StorageResult<()> {
        self.inner.append_visit(record).await?;
        self.last_seen
            .insert(record.visitor_id.clone(), record.visited_at)
            .await;
        Ok(())
    }

    async fn purge_visits(&self, now: i64, window_secs: i64) -> StorageResult<u64> {
        self.inner.purge_visits(now, window_secs).await
    }

    async fn visit_log_stats(&self, now: i64, window_secs: i64) -> StorageResult<VisitLogStats> {
        self.inner.visit_log_stats(now, window_secs).await
    }
}
