//! SQLite-backed result cache
//!
//! Schema: a single `entries(key TEXT PRIMARY KEY, value BLOB)` table. Keys
//! are [`CacheKey`]s, values are the driver's output bytes.
//!
//! Concurrency:
//! - Reads and writes share one connection behind a mutex, so a read can
//!   wait for an in-progress write statement but never for a driver call.
//!   WAL mode keeps other processes' readers off our writes.
//! - A miss, a forced update and each step of a bulk refresh take the
//!   per-key lock from [`KeyLocks`], so one key is computed at most once at a
//!   time while other keys proceed in parallel.
//! - The connection mutex is only held for single statements, never across
//!   a driver call.

use super::key_lock::KeyLocks;
use crate::driver::Driver;
use crate::error::{CacheError, StoreError};
use crate::key::{self, CacheKey};
use crate::paths;
use golist_types::Query;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the cache store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file
    pub path: PathBuf,

    /// How long opening or writing waits for another process's lock
    pub busy_timeout: Duration,

    /// Driver deadline for each entry during a bulk refresh
    pub refresh_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: paths::db_path(),
            busy_timeout: Duration::from_secs(5),
            refresh_timeout: Duration::from_secs(120),
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Outcome of [`CacheStore::update_all`]
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Entries recomputed and overwritten
    pub refreshed: usize,

    /// Entries deleted because they could not be refreshed
    pub pruned: Vec<PrunedEntry>,
}

impl RefreshReport {
    /// Every key seen by the scan
    pub fn visited(&self) -> usize {
        self.refreshed + self.pruned.len()
    }
}

#[derive(Debug, Clone)]
pub struct PrunedEntry {
    pub key: CacheKey,
    pub reason: String,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: usize,
}

/// Durable query -> result cache (thread-safe)
pub struct CacheStore {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
    driver: Arc<dyn Driver>,
    locks: KeyLocks,
    config: StoreConfig,
}

impl CacheStore {
    /// Open (or create) the cache database
    pub fn open(config: StoreConfig, driver: Arc<dyn Driver>) -> Result<Self, StoreError> {
        let path = config.path.clone();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        init_schema(&conn, config.busy_timeout).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "Cache database opened");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path,
            driver,
            locks: KeyLocks::new(),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached result for `query`, computing and persisting it on a miss.
    ///
    /// Concurrent misses for the same query run the driver once; the others
    /// wait and read the persisted result.
    pub async fn get(&self, query: &Query, timeout: Duration) -> Result<Vec<u8>, CacheError> {
        let key = key::encode(query);

        if let Some(bytes) = self.read(&key)? {
            debug!(patterns = ?query.patterns, "Cache hit");
            return Ok(bytes);
        }

        debug!(patterns = ?query.patterns, "Cache miss");
        with_deadline("get", query, timeout, self.fill(&key, query)).await
    }

    /// Recompute `query` and overwrite its entry, present or not
    pub async fn update(&self, query: &Query, timeout: Duration) -> Result<(), CacheError> {
        let key = key::encode(query);
        with_deadline("update", query, timeout, self.refresh(&key, query)).await
    }

    /// Recompute every stored entry.
    ///
    /// Keys are snapshotted first, so each originally present key is visited
    /// exactly once even though entries are rewritten and deleted on the way.
    /// Entries whose key no longer decodes or whose driver call fails are
    /// deleted. Only store failures abort the scan.
    pub async fn update_all(&self) -> Result<RefreshReport, StoreError> {
        let keys = self.keys()?;
        let mut report = RefreshReport::default();

        info!(entries = keys.len(), "Refreshing cached queries");

        for key in keys {
            let query = match key::decode(key.as_str()) {
                Ok(query) => query,
                Err(e) => {
                    warn!(key = %key, error = %e, "Pruning undecodable cache key");
                    self.delete(&key)?;
                    report.pruned.push(PrunedEntry {
                        key,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            debug!(patterns = ?query.patterns, "Refreshing");
            let refreshed = with_deadline(
                "refresh",
                &query,
                self.config.refresh_timeout,
                self.refresh(&key, &query),
            )
            .await;

            match refreshed {
                Ok(()) => report.refreshed += 1,
                Err(CacheError::Store(e)) => return Err(e),
                Err(e) => {
                    warn!(patterns = ?query.patterns, error = %e, "Refresh failed, pruning entry");
                    self.delete(&key)?;
                    report.pruned.push(PrunedEntry {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            refreshed = report.refreshed,
            pruned = report.pruned.len(),
            "Refresh complete"
        );
        Ok(report)
    }

    /// Whether a result is stored for `query`
    pub fn contains(&self, query: &Query) -> Result<bool, StoreError> {
        Ok(self.read(&key::encode(query))?.is_some())
    }

    /// Number of stored entries
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.stats()?.total_entries)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<CacheStats, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(value)), 0) FROM entries",
                [],
                |row| {
                    let entries: i64 = row.get(0)?;
                    let size: i64 = row.get(1)?;
                    Ok(CacheStats {
                        total_entries: entries as usize,
                        total_size_bytes: size as usize,
                    })
                },
            )
        })
    }

    /// Release the database handle. Later operations fail with
    /// [`StoreError::Closed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };

        checkpoint(&conn);
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;

        debug!(path = %self.path.display(), "Cache database closed");
        Ok(())
    }

    async fn fill(&self, key: &CacheKey, query: &Query) -> Result<Vec<u8>, CacheError> {
        let _guard = self.locks.lock(key.as_str()).await;

        // Another caller may have filled the entry while we waited.
        if let Some(bytes) = self.read(key)? {
            debug!(patterns = ?query.patterns, "Filled by concurrent caller");
            return Ok(bytes);
        }

        debug!(patterns = ?query.patterns, "Running driver");
        let bytes = self.driver.compute(query).await?;
        self.write(key, &bytes)?;
        Ok(bytes)
    }

    async fn refresh(&self, key: &CacheKey, query: &Query) -> Result<(), CacheError> {
        let _guard = self.locks.lock(key.as_str()).await;
        let bytes = self.driver.compute(query).await?;
        self.write(key, &bytes)?;
        debug!(patterns = ?query.patterns, bytes = bytes.len(), "Entry updated");
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        Ok(f(conn)?)
    }

    fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM entries WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn write(&self, key: &CacheKey, value: &[u8]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO entries (key, value) VALUES (?1, ?2)",
                params![key.as_str(), value],
            )
            .map(drop)
        })
    }

    fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM entries WHERE key = ?1", params![key.as_str()])
                .map(drop)
        })
    }

    fn keys(&self) -> Result<Vec<CacheKey>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM entries ORDER BY key")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.map(|row| row.map(CacheKey::from_stored)).collect()
        })
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            checkpoint(&conn);
        }
    }
}

fn init_schema(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL
        );
        "#,
    )
}

/// Fold the WAL back into the main file so it does not grow across restarts
fn checkpoint(conn: &Connection) {
    if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE") {
        warn!("Failed to checkpoint WAL: {}", e);
    }
}

async fn with_deadline<T>(
    operation: &str,
    query: &Query,
    timeout: Duration,
    fut: impl Future<Output = Result<T, CacheError>>,
) -> Result<T, CacheError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout {
            operation: format!("{} {}", operation, query.patterns.join(" ")),
            timeout_secs: timeout.as_secs(),
        }),
    }
}
