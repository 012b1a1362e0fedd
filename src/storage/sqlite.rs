use crate::models::{VisitLogStats, VisitRecord};
use crate::storage::{count_from_db, count_to_db, Storage, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        // Single-row counter table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS visit_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("INSERT INTO visit_counter (id, count) VALUES (1, 0) ON CONFLICT(id) DO NOTHING")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS visit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                visitor_id TEXT NOT NULL,
                visited_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_visit_log_visitor ON visit_log(visitor_id, visited_at)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_visit_log_visited_at ON visit_log(visited_at)")
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn load_count(&self) -> StorageResult<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT count FROM visit_counter WHERE id = 1")
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(count.map(count_from_db).unwrap_or(0))
    }

    async fn increment_count(&self) -> StorageResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO visit_counter (id, count) VALUES (1, 1)
            ON CONFLICT(id) DO UPDATE SET count = visit_counter.count + 1
            RETURNING count
            "#,
        )
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(count_from_db(count))
    }

    async fn set_count(&self, value: u64) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO visit_counter (id, count) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET count = excluded.count
            "#,
        )
        .bind(count_to_db(value)?)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn latest_live_visit(
        &self,
        visitor_id: &str,
        now: i64,
        window_secs: i64,
    ) -> StorageResult<Option<i64>> {
        let latest = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(visited_at) FROM visit_log WHERE visitor_id = ? AND visited_at > ?",
        )
        .bind(visitor_id)
        .bind(now.saturating_sub(window_secs))
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(latest)
    }

    async fn append_visit(&self, record: &VisitRecord) -> StorageResult<()> {
        sqlx::query("INSERT INTO visit_log (visitor_id, visited_at) VALUES (?, ?)")
            .bind(&record.visitor_id)
            .bind(record.visited_at)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn purge_visits(&self, now: i64, window_secs: i64) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM visit_log WHERE visited_at <= ?")
            .bind(now.saturating_sub(window_secs))
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn visit_log_stats(&self, now: i64, window_secs: i64) -> StorageResult<VisitLogStats> {
        let (total, live) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN visited_at > ? THEN 1 ELSE 0 END), 0)
            FROM visit_log
            "#,
        )
        .bind(now.saturating_sub(window_secs))
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(VisitLogStats {
            total: count_from_db(total),
            live: count_from_db(live),
            malformed: 0,
        })
    }
}
