pub mod cached;
pub mod file;
pub mod postgres;
pub mod sqlite;
pub mod trait_def;

pub use cached::CachedStorage;
pub use file::FileStorage;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;
pub use trait_def::{Storage, StorageError, StorageResult};

use crate::config::{StorageBackend, StorageConfig};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Open the configured backend without any caching layer
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config.backend {
        StorageBackend::File => {
            info!("Using file storage in {}", config.data_dir);
            Arc::new(FileStorage::new(&config.data_dir))
        }
        StorageBackend::Sqlite => {
            info!("Using SQLite storage: {}", config.database_url);
            Arc::new(SqliteStorage::new(&config.database_url, config.max_connections).await?)
        }
        StorageBackend::Postgres => {
            info!("Using PostgreSQL storage");
            Arc::new(PostgresStorage::new(&config.database_url, config.max_connections).await?)
        }
    };

    Ok(storage)
}

pub(crate) fn count_from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(crate) fn count_to_db(value: u64) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::Other(anyhow::anyhow!("count {value} exceeds database range")))
}
