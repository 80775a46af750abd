//! SQLite-backed dead-letter store
//!
//! Every call checks a connection out of the soft cache on a blocking
//! worker, runs a single statement and checks the connection back in. Calls
//! never share a connection or a transaction.

use crate::conn_cache::{CacheStats, ConnectionCache};
use crate::entry::{format_timestamp, parse_timestamp, DeadLetterEntry, NewDeadLetter};
use crate::error::{DeadLetterError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dead_letter_queue (
    task_id TEXT PRIMARY KEY,
    feature TEXT NOT NULL,
    target_url TEXT NOT NULL,
    failure_reason TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    workflow_state TEXT,
    created_at TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    last_error_phase TEXT
);
CREATE INDEX IF NOT EXISTS idx_dead_letter_failed_at
    ON dead_letter_queue (failed_at DESC, task_id);
";

const SELECT_COLUMNS: &str = "task_id, feature, target_url, failure_reason, retry_count, \
     workflow_state, created_at, failed_at, last_error_phase";

/// Dead-letter store settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Most idle connections kept for reuse
    pub cache_capacity: usize,
    /// How long SQLite waits on a locked database
    pub busy_timeout: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskguard-dlq.db"),
            cache_capacity: 5,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

impl DeadLetterConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Durable store for tasks that exhausted every recovery attempt
///
/// Cheap to clone; clones share the connection cache.
///
/// # Example
/// ```no_run
/// use taskguard_core_dead_letter::{DeadLetterConfig, DeadLetterStore, NewDeadLetter};
///
/// # async fn example() -> taskguard_core_dead_letter::Result<()> {
/// let store = DeadLetterStore::open(DeadLetterConfig::new("dlq.db")).await?;
///
/// store
///     .add_entry(
///         NewDeadLetter::new("task-42", "summarize", "https://api.example/v1", "retries exhausted")
///             .with_retry_count(3),
///     )
///     .await?;
///
/// for entry in store.get_entries(20, 0).await? {
///     println!("{} failed at {}", entry.task_id, entry.failed_at);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterStore {
    cache: Arc<ConnectionCache>,
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("path", &self.cache.path())
            .field("closed", &self.cache.is_closed())
            .finish()
    }
}

impl DeadLetterStore {
    /// Create a store without touching the database
    pub fn new(config: DeadLetterConfig) -> Self {
        Self {
            cache: Arc::new(ConnectionCache::new(
                config.path,
                config.busy_timeout,
                config.cache_capacity,
            )),
        }
    }

    /// Create a store and make sure its schema exists
    pub async fn open(config: DeadLetterConfig) -> Result<Self> {
        let store = Self::new(config);
        store.initialize().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        self.cache.path()
    }

    /// Create the table and index if they do not exist yet
    pub async fn initialize(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        debug!(path = %self.path().display(), "dead-letter schema ready");
        Ok(())
    }

    /// Record a terminally failed task
    ///
    /// Returns the entry as stored. A second entry for the same task fails
    /// with [`DeadLetterError::DuplicateTask`].
    pub async fn add_entry(&self, new: NewDeadLetter) -> Result<DeadLetterEntry> {
        let entry = new.into_entry(Utc::now());
        let workflow_state = entry
            .workflow_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = entry.clone();
        self.with_connection(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO dead_letter_queue (task_id, feature, target_url, failure_reason, \
                 retry_count, workflow_state, created_at, failed_at, last_error_phase) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.task_id,
                    row.feature,
                    row.target_url,
                    row.failure_reason,
                    row.retry_count,
                    workflow_state,
                    format_timestamp(&row.created_at),
                    format_timestamp(&row.failed_at),
                    row.last_error_phase,
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(DeadLetterError::DuplicateTask(row.task_id))
                }
                Err(err) => Err(err.into()),
            }
        })
        .await?;

        warn!(
            task_id = %entry.task_id,
            feature = %entry.feature,
            retry_count = entry.retry_count,
            reason = %entry.failure_reason,
            "task moved to dead-letter store"
        );
        Ok(entry)
    }

    /// Entries newest-failed first, ties broken by task id
    pub async fn get_entries(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM dead_letter_queue \
                 ORDER BY failed_at DESC, task_id ASC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt
                .query_map(params![limit, offset], RawEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RawEntry::into_entry).collect()
        })
        .await
    }

    /// Point lookup by task id
    pub async fn get_entry(&self, task_id: &str) -> Result<Option<DeadLetterEntry>> {
        let task_id = task_id.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM dead_letter_queue WHERE task_id = ?1"),
                params![task_id],
                RawEntry::from_row,
            )
            .optional()?
            .map(RawEntry::into_entry)
            .transpose()
        })
        .await
    }

    /// Delete an entry, reporting whether one existed
    pub async fn remove_entry(&self, task_id: &str) -> Result<bool> {
        let id = task_id.to_string();
        let removed = self
            .with_connection(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM dead_letter_queue WHERE task_id = ?1", params![id])?;
                Ok(deleted > 0)
            })
            .await?;

        if removed {
            info!(task_id, "dead-letter entry resolved");
        }
        Ok(removed)
    }

    /// Number of stored entries
    pub async fn count(&self) -> Result<u64> {
        self.with_connection(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM dead_letter_queue", [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    /// Close cached connections; later calls fail with [`DeadLetterError::Closed`]
    pub async fn close(&self) {
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.close()).await {
            Ok(closed) => debug!(closed, "dead-letter store closed"),
            Err(err) => warn!(error = %err, "failed to drain dead-letter connections"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cache.is_closed()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Run `f` on a cached connection in the blocking pool
    async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let cache = self.cache.clone();
        tokio::task::spawn_blocking(move || {
            let conn = cache.checkout()?;
            let result = f(&conn);
            cache.checkin(conn);
            result
        })
        .await?
    }
}

/// Row as read from SQLite, before timestamps and JSON are decoded
struct RawEntry {
    task_id: String,
    feature: String,
    target_url: String,
    failure_reason: String,
    retry_count: u32,
    workflow_state: Option<String>,
    created_at: String,
    failed_at: String,
    last_error_phase: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            feature: row.get(1)?,
            target_url: row.get(2)?,
            failure_reason: row.get(3)?,
            retry_count: row.get(4)?,
            workflow_state: row.get(5)?,
            created_at: row.get(6)?,
            failed_at: row.get(7)?,
            last_error_phase: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<DeadLetterEntry> {
        let workflow_state = self
            .workflow_state
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(DeadLetterEntry {
            task_id: self.task_id,
            feature: self.feature,
            target_url: self.target_url,
            failure_reason: self.failure_reason,
            retry_count: self.retry_count,
            workflow_state,
            created_at: parse_timestamp("created_at", self.created_at)?,
            failed_at: parse_timestamp("failed_at", self.failed_at)?,
            last_error_phase: self.last_error_phase,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeadLetterStore::new(DeadLetterConfig::new(dir.path().join("dlq.db")));

        store.initialize().await.unwrap();
        store.initialize().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeadLetterStore::open(DeadLetterConfig::new(dir.path().join("dlq.db")))
            .await
            .unwrap();

        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO dead_letter_queue (task_id, feature, target_url, failure_reason, \
                     retry_count, created_at, failed_at) VALUES ('bad', 'f', 't', 'r', 0, 'x', 'y')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.get_entry("bad").await.unwrap_err();
        assert!(matches!(err, DeadLetterError::InvalidTimestamp { .. }));
    }

    #[tokio::test]
    async fn test_calls_reuse_cached_connection() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeadLetterStore::open(DeadLetterConfig::new(dir.path().join("dlq.db")))
            .await
            .unwrap();

        for _ in 0..5 {
            store.count().await.unwrap();
        }
        let stats = store.cache_stats();
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.capacity, 5);
    }
}
