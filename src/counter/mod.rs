//! Visit counter service
//!
//! Decides whether a visit is new and, exactly once per qualifying visit,
//! increments the persisted counter. Two mutually exclusive strategies are
//! supported, chosen per deployment:
//! - identity window: a visitor id counts again only after the window elapses
//! - session: the caller tells us whether its session was already counted
//!
//! All read-check-increment-append-purge sequences run under one async
//! mutex, so concurrent requests never lose an increment and a purge never
//! races an append.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, PurgeChance};
use crate::models::{VisitLogStats, VisitRecord};
use crate::storage::{Storage, StorageResult};

/// Result of recording a visit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    /// The counter was incremented to this value
    Counted(u64),
    /// Already counted; this is the unchanged value
    Repeat(u64),
}

impl VisitOutcome {
    pub fn count(&self) -> u64 {
        match *self {
            VisitOutcome::Counted(count) | VisitOutcome::Repeat(count) => count,
        }
    }

    pub fn is_counted(&self) -> bool {
        matches!(self, VisitOutcome::Counted(_))
    }
}

pub struct VisitCounter {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    purge_chance: Arc<dyn PurgeChance>,
    window_secs: i64,
    write_lock: Mutex<()>,
    /// Last count observed from storage, served when storage fails
    last_known: AtomicU64,
}

impl VisitCounter {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        purge_chance: Arc<dyn PurgeChance>,
        window_secs: i64,
    ) -> Self {
        Self {
            storage,
            clock,
            purge_chance,
            window_secs,
            write_lock: Mutex::new(()),
            last_known: AtomicU64::new(0),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Best-effort count for degraded responses (0 until storage was read once)
    pub fn last_known_count(&self) -> u64 {
        self.last_known.load(Ordering::Relaxed)
    }

    /// Track the latest value storage reported, which may go down after a
    /// manual correction from another process
    fn remember(&self, count: u64) {
        self.last_known.store(count, Ordering::Relaxed);
    }

    /// Read the counter without counting anything
    pub async fn current_count(&self) -> StorageResult<u64> {
        let count = self.storage.load_count().await?;
        self.remember(count);
        Ok(count)
    }

    /// Identity-window strategy: count `visitor_id` unless it was counted
    /// within the window.
    pub async fn record_visit(&self, visitor_id: &str) -> StorageResult<VisitOutcome> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();

        let count = self.storage.load_count().await?;
        self.remember(count);

        if self
            .storage
            .has_live_visit(visitor_id, now, self.window_secs)
            .await?
        {
            debug!(visitor_id, count, "repeat visit within window");
            return Ok(VisitOutcome::Repeat(count));
        }

        let count = self.storage.increment_count().await?;
        self.remember(count);

        if self.purge_chance.should_purge() {
            match self.storage.purge_visits(now, self.window_secs).await {
                Ok(removed) => debug!(removed, "purged expired visit records"),
                Err(e) => warn!("Visit log purge failed, will retry later: {}", e),
            }
        }

        self.storage
            .append_visit(&VisitRecord::new(visitor_id, now))
            .await?;

        debug!(visitor_id, count, "counted visit");
        Ok(VisitOutcome::Counted(count))
    }

    /// Session strategy: count once unless the session already carries the flag.
    pub async fn record_session_visit(&self, already_counted: bool) -> StorageResult<VisitOutcome> {
        if already_counted {
            return self.current_count().await.map(VisitOutcome::Repeat);
        }

        let _guard = self.write_lock.lock().await;
        let current = self.storage.load_count().await?;
        self.remember(current);

        let count = self.storage.increment_count().await?;
        self.remember(count);

        debug!(count, "counted new session");
        Ok(VisitOutcome::Counted(count))
    }

    /// Force a purge pass over the visit log
    pub async fn purge(&self) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;
        self.storage
            .purge_visits(self.clock.now(), self.window_secs)
            .await
    }

    /// Manual counter correction
    pub async fn set_count(&self, value: u64) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        self.storage.set_count(value).await?;
        self.last_known.store(value, Ordering::Relaxed);
        info!(value, "visit counter set manually");
        Ok(())
    }

    pub async fn visit_log_stats(&self) -> StorageResult<VisitLogStats> {
        self.storage
            .visit_log_stats(self.clock.now(), self.window_secs)
            .await
    }
}
