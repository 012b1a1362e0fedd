//! Plain-file storage: a decimal counter file and a line-oriented visit log
//!
//! Layout inside the data directory:
//! - `counter.txt`: the count as a decimal integer
//! - `ip_log.txt`: one `identifier|unix_timestamp` line per counted visit
//!
//! - `counter.lock`: empty file carrying an exclusive advisory lock
//!
//! Writes hold the store's mutex and then the advisory lock, so neither
//! another task nor another process (such as `tally-admin`) can interleave
//! with a read-modify-write, and a purge rewrite never drops a line appended
//! after it read the log. Rewrites of either file go through a temp file
//! and an atomic rename.

use crate::models::{VisitLogStats, VisitRecord};
use crate::storage::{Storage, StorageError, StorageResult};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const COUNTER_FILE: &str = "counter.txt";
pub const VISIT_LOG_FILE: &str = "ip_log.txt";
pub const LOCK_FILE: &str = "counter.lock";

pub struct FileStorage {
    dir: PathBuf,
    counter_path: PathBuf,
    visit_log_path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
}

/// Exclusive `flock` on the data directory's lock file, released on drop
struct DirLock {
    file: std::fs::File,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("Failed to release data directory lock: {}", e);
        }
    }
}

/// Parsed visit log with the number of lines that could not be read
struct VisitLog {
    records: Vec<VisitRecord>,
    malformed: u64,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            counter_path: dir.join(COUNTER_FILE),
            visit_log_path: dir.join(VISIT_LOG_FILE),
            lock_path: dir.join(LOCK_FILE),
            dir,
            lock: Mutex::new(()),
        }
    }

    pub fn counter_path(&self) -> &Path {
        &self.counter_path
    }

    pub fn visit_log_path(&self) -> &Path {
        &self.visit_log_path
    }

    /// Block (off the async runtime) until this store holds the directory lock
    async fn lock_dir(&self) -> StorageResult<DirLock> {
        let path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || -> StorageResult<DirLock> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;
            fs2::FileExt::lock_exclusive(&file).map_err(|e| StorageError::io(&path, e))?;
            Ok(DirLock { file })
        })
        .await
        .map_err(|e| StorageError::Other(anyhow!("directory lock task failed: {e}")))?
    }

    async fn read_count(&self) -> StorageResult<u64> {
        match tokio::fs::read_to_string(&self.counter_path).await {
            Ok(raw) => Ok(parse_count(&raw, &self.counter_path)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::io(&self.counter_path, e)),
        }
    }

    async fn write_count(&self, value: u64) -> StorageResult<()> {
        replace_file(&self.dir, &self.counter_path, value.to_string().into_bytes()).await
    }

    async fn read_visit_log(&self) -> StorageResult<VisitLog> {
        let raw = match tokio::fs::read_to_string(&self.visit_log_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(StorageError::io(&self.visit_log_path, e)),
        };

        let mut log = VisitLog {
            records: Vec::new(),
            malformed: 0,
        };

        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match VisitRecord::parse_log_line(line) {
                Some(record) => log.records.push(record),
                None => {
                    warn!(
                        path = %self.visit_log_path.display(),
                        line = index + 1,
                        "skipping malformed visit log entry"
                    );
                    log.malformed += 1;
                }
            }
        }

        Ok(log)
    }
}

/// Counter contents are trusted loosely: garbage reads as 0 rather than failing
fn parse_count(raw: &str, path: &Path) -> u64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }
    trimmed.parse::<u64>().unwrap_or_else(|_| {
        warn!(path = %path.display(), contents = %trimmed, "counter file is not a number, treating as 0");
        0
    })
}

/// Write `contents` to a temp file next to `target`, then rename it into place
async fn replace_file(dir: &Path, target: &Path, contents: Vec<u8>) -> StorageResult<()> {
    let dir = dir.to_path_buf();
    let target = target.to_path_buf();

    tokio::task::spawn_blocking(move || -> StorageResult<()> {
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StorageError::io(&dir, e))?;
        tmp.write_all(&contents)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StorageError::io(&target, e))?;
        tmp.persist(&target)
            .map_err(|e| StorageError::io(&target, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| StorageError::Other(anyhow!("file write task failed: {e}")))?
}

#[async_trait]
impl Storage for FileStorage {
    async fn init(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Cannot create data directory {:?}", self.dir))?;
        let _dir_lock = self.lock_dir().await?;

        if tokio::fs::try_exists(&self.counter_path).await? {
            debug!(path = %self.counter_path.display(), "counter file present");
        } else {
            self.write_count(0)
                .await
                .with_context(|| format!("Cannot create counter file {:?}", self.counter_path))?;
        }

        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.visit_log_path)
            .await
            .with_context(|| format!("Cannot open visit log {:?}", self.visit_log_path))?;

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn load_count(&self) -> StorageResult<u64> {
        let _guard = self.lock.lock().await;
        self.read_count().await
    }

    async fn increment_count(&self) -> StorageResult<u64> {
        let _guard = self.lock.lock().await;
        let _dir_lock = self.lock_dir().await?;
        let next = self
            .read_count()
            .await?
            .checked_add(1)
            .ok_or_else(|| StorageError::Other(anyhow!("visit counter overflowed")))?;
        self.write_count(next).await?;
        Ok(next)
    }

    async fn set_count(&self, value: u64) -> StorageResult<()> {
        let _guard = self.lock.lock().await;
        let _dir_lock = self.lock_dir().await?;
        self.write_count(value).await
    }

    async fn latest_live_visit(
        &self,
        visitor_id: &str,
        now: i64,
        window_secs: i64,
    ) -> StorageResult<Option<i64>> {
        let _guard = self.lock.lock().await;
        let log = self.read_visit_log().await?;
        Ok(log
            .records
            .iter()
            .filter(|r| r.visitor_id == visitor_id && r.is_live(now, window_secs))
            .map(|r| r.visited_at)
            .max())
    }

    async fn append_visit(&self, record: &VisitRecord) -> StorageResult<()> {
        if record.visitor_id.contains(['\n', '\r']) {
            return Err(StorageError::Other(anyhow!(
                "visitor id {:?} contains a line break",
                record.visitor_id
            )));
        }

        let _guard = self.lock.lock().await;
        let _dir_lock = self.lock_dir().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.visit_log_path)
            .await
            .map_err(|e| StorageError::io(&self.visit_log_path, e))?;

        file.write_all(record.to_log_line().as_bytes())
            .await
            .map_err(|e| StorageError::io(&self.visit_log_path, e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::io(&self.visit_log_path, e))?;

        Ok(())
    }

    async fn purge_visits(&self, now: i64, window_secs: i64) -> StorageResult<u64> {
        let _guard = self.lock.lock().await;
        let _dir_lock = self.lock_dir().await?;
        let log = self.read_visit_log().await?;

        let (live, expired): (Vec<VisitRecord>, Vec<VisitRecord>) = log
            .records
            .into_iter()
            .partition(|r| r.is_live(now, window_secs));
        let expired = expired.len() as u64;
        let removed = expired + log.malformed;

        if removed > 0 {
            let kept: String = live.iter().map(VisitRecord::to_log_line).collect();
            replace_file(&self.dir, &self.visit_log_path, kept.into_bytes()).await?;
        }

        debug!(expired, malformed = log.malformed, "purged visit log");
        Ok(removed)
    }

    async fn visit_log_stats(&self, now: i64, window_secs: i64) -> StorageResult<VisitLogStats> {
        let _guard = self.lock.lock().await;
        let log = self.read_visit_log().await?;
        Ok(VisitLogStats {
            total: log.records.len() as u64,
            live: log
                .records
                .iter()
                .filter(|r| r.is_live(now, window_secs))
                .count() as u64,
            malformed: log.malformed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const WINDOW: i64 = 86_400;

    async fn setup() -> (TempDir, FileStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("data"));
        storage.init().await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_init_creates_files() {
        let (_dir, storage) = setup().await;

        let counter = tokio::fs::read_to_string(storage.counter_path()).await.unwrap();
        assert_eq!(counter, "0");
        assert!(tokio::fs::try_exists(storage.visit_log_path()).await.unwrap());
        assert_eq!(storage.load_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_init_keeps_existing_counter() {
        let (_dir, storage) = setup().await;
        storage.set_count(41).await.unwrap();

        storage.init().await.unwrap();
        assert_eq!(storage.load_count().await.unwrap(), 41);
    }

    #[tokio::test]
    async fn test_missing_counter_reads_as_zero() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        assert_eq!(storage.load_count().await.unwrap(), 0);
        assert_eq!(storage.increment_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_garbled_counter_reads_as_zero() {
        let (_dir, storage) = setup().await;
        tokio::fs::write(storage.counter_path(), "lots").await.unwrap();
        assert_eq!(storage.load_count().await.unwrap(), 0);

        tokio::fs::write(storage.counter_path(), " 12\n").await.unwrap();
        assert_eq!(storage.load_count().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_increment_persists() {
        let (_dir, storage) = setup().await;
        assert_eq!(storage.increment_count().await.unwrap(), 1);
        assert_eq!(storage.increment_count().await.unwrap(), 2);

        let counter = tokio::fs::read_to_string(storage.counter_path()).await.unwrap();
        assert_eq!(counter, "2");
    }

    #[tokio::test]
    async fn test_append_writes_log_format() {
        let (_dir, storage) = setup().await;
        storage
            .append_visit(&VisitRecord::new("1.2.3.4", 1_700_000_000))
            .await
            .unwrap();
        storage
            .append_visit(&VisitRecord::new("5.6.7.8", 1_700_000_100))
            .await
            .unwrap();

        let log = tokio::fs::read_to_string(storage.visit_log_path()).await.unwrap();
        assert_eq!(log, "1.2.3.4|1700000000\n5.6.7.8|1700000100\n");
    }

    #[tokio::test]
    async fn test_append_rejects_line_breaks() {
        let (_dir, storage) = setup().await;
        let result = storage
            .append_visit(&VisitRecord::new("evil\n9.9.9.9", 1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_has_live_visit_respects_window() {
        let (_dir, storage) = setup().await;
        storage
            .append_visit(&VisitRecord::new("1.2.3.4", 1_000))
            .await
            .unwrap();

        assert!(storage.has_live_visit("1.2.3.4", 1_000, WINDOW).await.unwrap());
        assert!(storage.has_live_visit("1.2.3.4", 1_000 + WINDOW - 1, WINDOW).await.unwrap());
        assert!(!storage.has_live_visit("1.2.3.4", 1_000 + WINDOW, WINDOW).await.unwrap());
        assert!(!storage.has_live_visit("5.6.7.8", 1_000, WINDOW).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (_dir, storage) = setup().await;
        tokio::fs::write(
            storage.visit_log_path(),
            "garbage\n1.2.3.4|1000\n\n5.6.7.8|not-a-time\n9.9.9.9|1000\n",
        )
        .await
        .unwrap();

        assert!(storage.has_live_visit("1.2.3.4", 1_000, WINDOW).await.unwrap());
        assert!(storage.has_live_visit("9.9.9.9", 1_000, WINDOW).await.unwrap());
        assert!(!storage.has_live_visit("5.6.7.8", 1_000, WINDOW).await.unwrap());

        let stats = storage.visit_log_stats(1_000, WINDOW).await.unwrap();
        assert_eq!(
            stats,
            VisitLogStats {
                total: 2,
                live: 2,
                malformed: 2
            }
        );
    }

    #[tokio::test]
    async fn test_purge_drops_only_expired_and_malformed() {
        let (_dir, storage) = setup().await;
        tokio::fs::write(
            storage.visit_log_path(),
            "old|100\nbroken line\nrecent|90000\nnewest|100000\n",
        )
        .await
        .unwrap();

        let now = 100_000;
        let removed = storage.purge_visits(now, WINDOW).await.unwrap();
        assert_eq!(removed, 2);

        let log = tokio::fs::read_to_string(storage.visit_log_path()).await.unwrap();
        assert_eq!(log, "recent|90000\nnewest|100000\n");
    }

    #[tokio::test]
    async fn test_purge_without_expired_entries_leaves_file_alone() {
        let (_dir, storage) = setup().await;
        storage
            .append_visit(&VisitRecord::new("1.2.3.4", 1_000))
            .await
            .unwrap();

        assert_eq!(storage.purge_visits(1_000, WINDOW).await.unwrap(), 0);
        let log = tokio::fs::read_to_string(storage.visit_log_path()).await.unwrap();
        assert_eq!(log, "1.2.3.4|1000\n");
    }

    #[tokio::test]
    async fn test_purge_everything_leaves_empty_log() {
        let (_dir, storage) = setup().await;
        storage
            .append_visit(&VisitRecord::new("1.2.3.4", 1_000))
            .await
            .unwrap();

        assert_eq!(storage.purge_visits(1_000 + WINDOW, WINDOW).await.unwrap(), 1);
        let log = tokio::fs::read_to_string(storage.visit_log_path()).await.unwrap();
        assert!(log.is_empty());

        storage
            .append_visit(&VisitRecord::new("5.6.7.8", 1_000 + WINDOW))
            .await
            .unwrap();
        let stats = storage.visit_log_stats(1_000 + WINDOW, WINDOW).await.unwrap();
        assert_eq!(stats.total, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_stores_on_one_directory_never_lose_increments() {
        let (dir, first) = setup().await;
        let first = Arc::new(first);
        let second = Arc::new(FileStorage::new(dir.path().join("data")));

        let mut handles = vec![];
        for store in [first.clone(), second.clone()] {
            for _ in 0..100 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move { store.increment_count().await }));
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(first.load_count().await.unwrap(), 200);
        assert_eq!(second.load_count().await.unwrap(), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_purge_from_second_store_keeps_fresh_appends() {
        let (dir, writer) = setup().await;
        let writer = Arc::new(writer);
        let purger = Arc::new(FileStorage::new(dir.path().join("data")));
        let now = 1_000_000;

        let appends = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move {
                for i in 0..200 {
                    writer
                        .append_visit(&VisitRecord::new(format!("10.0.{}.{}", i / 256, i % 256), now))
                        .await
                        .unwrap();
                }
            })
        };
        let purges = {
            let purger = Arc::clone(&purger);
            tokio::spawn(async move {
                for _ in 0..50 {
                    purger.purge_visits(now, WINDOW).await.unwrap();
                }
            })
        };
        appends.await.unwrap();
        purges.await.unwrap();

        let stats = writer.visit_log_stats(now, WINDOW).await.unwrap();
        assert_eq!(stats.total, 200, "records appended during purges must survive");
        assert_eq!(stats.live, 200);
    }

    #[tokio::test]
    async fn test_lock_file_is_created_beside_data() {
        let (_dir, storage) = setup().await;
        storage.increment_count().await.unwrap();
        assert!(tokio::fs::try_exists(&storage.lock_path).await.unwrap());
    }
}
