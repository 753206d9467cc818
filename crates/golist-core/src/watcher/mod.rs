//! File watchers that keep cached results fresh
//!
//! Each cached query can own one watch job. A job observes the files named by
//! the query's `file=` patterns, re-runs the query when one of them is
//! written, and disappears after `ttl` without requests or file activity.
//!
//! Known limitation: the watched set is fixed when the job is created. New
//! files (create events) and renames are not picked up.

mod job;

use crate::cache::CacheStore;
use crate::error::WatchError;
use crate::key;
use golist_types::Query;
use job::{EventResult, JobHandle, JobTasks};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Configuration for watch jobs
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Idle lifetime of a job
    pub ttl: Duration,

    /// Deadline for the update triggered by a write event
    pub refresh_timeout: Duration,

    /// Pending notify events buffered per job
    pub event_buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            refresh_timeout: Duration::from_secs(30),
            event_buffer: 100,
        }
    }
}

/// State shared between the registry and its jobs' tasks
pub(crate) struct Shared {
    jobs: Mutex<HashMap<String, JobHandle>>,
    store: Arc<CacheStore>,
    config: WatcherConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    next_id: AtomicU64,
}

impl Shared {
    /// Drop the job for `key` if it is still the one with `id` and no
    /// extension is pending. Returns false when the job was kept.
    ///
    /// Extensions are requested with the map lock held, so checking
    /// `extend_rx` under the same lock leaves no window for one to land
    /// between the check and the removal. The handle is dropped after the
    /// lock is released.
    fn expire(&self, key: &str, id: u64, extend_rx: &mut mpsc::Receiver<()>) -> bool {
        let removed = {
            let mut jobs = self.jobs.lock();
            if extend_rx.try_recv().is_ok() {
                return false;
            }
            match jobs.get(key) {
                Some(job) if job.id == id => jobs.remove(key),
                _ => None,
            }
        };
        drop(removed);
        true
    }
}

/// Maps cache keys to their watch jobs
pub struct WatcherRegistry {
    shared: Arc<Shared>,
}

impl WatcherRegistry {
    pub fn new(store: Arc<CacheStore>, config: WatcherConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(HashMap::new()),
                store,
                config,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start watching the files of `query`, or extend its existing job.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(&self, query: &Query) -> Result<(), WatchError> {
        let key = key::encode(query).into_string();

        if self.extend(&key, query)? {
            return Ok(());
        }

        // Build the watcher without holding the map lock.
        let (handle, tasks) = self.create_job(key.clone(), query)?;

        let rejected = {
            let mut jobs = self.shared.jobs.lock();
            if self.shared.shutdown.is_cancelled() {
                return Err(WatchError::Closed);
            }
            match jobs.get(&key) {
                Some(existing) => {
                    // Lost a race with another caller for the same key.
                    existing.request_extension();
                    Some(handle)
                }
                None => {
                    jobs.insert(key, handle);
                    None
                }
            }
        };

        match rejected {
            Some(handle) => drop(handle),
            None => {
                debug!(patterns = ?query.patterns, "Watch job started");
                tasks.spawn(&self.shared);
            }
        }

        Ok(())
    }

    /// Whether a job exists for `query`
    pub fn is_watching(&self, query: &Query) -> bool {
        let key = key::encode(query);
        self.shared.jobs.lock().contains_key(key.as_str())
    }

    /// Number of live jobs
    pub fn len(&self) -> usize {
        self.shared.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every job and wait for their tasks to exit.
    ///
    /// Later `watch` calls fail with [`WatchError::Closed`]; closing twice is
    /// a no-op.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();

        let jobs: Vec<JobHandle> = {
            let mut jobs = self.shared.jobs.lock();
            jobs.drain().map(|(_, job)| job).collect()
        };
        let stopped = jobs.len();
        drop(jobs);

        self.shared.tasks.close();
        self.shared.tasks.wait().await;

        if stopped > 0 {
            info!(jobs = stopped, "Watchers closed");
        }
    }

    /// Returns true when a job already existed and was extended
    fn extend(&self, key: &str, query: &Query) -> Result<bool, WatchError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(WatchError::Closed);
        }

        let jobs = self.shared.jobs.lock();
        match jobs.get(key) {
            Some(job) => {
                debug!(patterns = ?query.patterns, "Already watched, extending");
                job.request_extension();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn create_job(&self, key: String, query: &Query) -> Result<(JobHandle, JobTasks), WatchError> {
        let (events_tx, events_rx) = mpsc::channel::<EventResult>(self.shared.config.event_buffer);
        let (extend_tx, extend_rx) = mpsc::channel::<()>(1);

        let notify_tx = events_tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.blocking_send(res);
            },
            notify::Config::default(),
        )?;

        for path in query.watch_paths() {
            match watcher.watch(&path, RecursiveMode::NonRecursive) {
                Ok(()) => debug!(path = %path.display(), "Watching path"),
                Err(e) => warn!(path = %path.display(), error = %e, "Cannot watch path, skipping"),
            }
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shared.shutdown.child_token();

        #[cfg(not(test))]
        drop(events_tx);

        let handle = JobHandle::new(
            id,
            extend_tx.clone(),
            cancel.clone(),
            watcher,
            #[cfg(test)]
            events_tx,
        );
        let tasks = JobTasks {
            id,
            key,
            query: query.clone(),
            extend_tx,
            extend_rx,
            events_rx,
            cancel,
        };

        Ok((handle, tasks))
    }

    /// Feed a synthetic notify event to the job of `query`
    #[cfg(test)]
    fn inject(&self, query: &Query, event: notify::Event) -> bool {
        let key = key::encode(query);
        let jobs = self.shared.jobs.lock();
        jobs.get(key.as_str())
            .map(|job| job.events_tx.try_send(Ok(event)).is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StoreConfig;
    use crate::test_support::StubDriver;
    use notify::event::{CreateKind, DataChange, ModifyKind};
    use notify::{Event, EventKind};
    use std::path::{Path, PathBuf};
    use tempfile::{tempdir, TempDir};

    const TTL: Duration = Duration::from_secs(60);

    struct Fixture {
        _dir: TempDir,
        driver: Arc<StubDriver>,
        store: Arc<CacheStore>,
        registry: WatcherRegistry,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let driver = StubDriver::new();
        let store = Arc::new(
            CacheStore::open(StoreConfig::new(dir.path().join("golist.db")), driver.clone())
                .unwrap(),
        );
        let registry = WatcherRegistry::new(
            Arc::clone(&store),
            WatcherConfig {
                ttl: TTL,
                ..Default::default()
            },
        );
        Fixture {
            _dir: dir,
            driver,
            store,
            registry,
        }
    }

    fn query(pattern: &str) -> Query {
        Query::new("/repo", vec![pattern.to_string()])
    }

    fn event(kind: EventKind, path: &Path) -> Event {
        Event {
            kind,
            paths: vec![path.to_path_buf()],
            ..Default::default()
        }
    }

    fn write_event(path: &Path) -> Event {
        event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), path)
    }

    /// Let spawned tasks run; under a paused clock this also advances time.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn wait_for_calls(driver: &StubDriver, expected: usize) {
        for _ in 0..500 {
            if driver.calls() >= expected {
                return;
            }
            settle().await;
        }
        panic!("driver reached {} calls, expected {}", driver.calls(), expected);
    }

    #[tokio::test]
    async fn test_one_job_per_key() {
        let f = fixture();

        f.registry.watch(&query("./...")).unwrap();
        f.registry.watch(&query("./...")).unwrap();
        f.registry.watch(&query("./other/...")).unwrap();

        assert_eq!(f.registry.len(), 2);
        assert!(f.registry.is_watching(&query("./...")));
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_repeated_extensions_coalesce() {
        let f = fixture();

        for _ in 0..10 {
            f.registry.watch(&query("./...")).unwrap();
        }

        assert_eq!(f.registry.len(), 1);
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_unwatchable_paths_are_skipped() {
        let f = fixture();
        let q = query("file=/nonexistent/golist/main.go");

        f.registry.watch(&q).unwrap();
        assert!(f.registry.is_watching(&q));
        f.registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_expires_after_ttl() {
        let f = fixture();
        let q = query("./...");

        f.registry.watch(&q).unwrap();
        tokio::time::sleep(TTL - Duration::from_secs(1)).await;
        assert!(f.registry.is_watching(&q));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!f.registry.is_watching(&q));
        assert!(f.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_extends_deadline() {
        let f = fixture();
        let q = query("./...");

        f.registry.watch(&q).unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        f.registry.watch(&q).unwrap();

        // Past the original deadline
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(f.registry.is_watching(&q));

        // Past the extended deadline
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!f.registry.is_watching(&q));
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_events_extend_deadline() {
        let f = fixture();
        let q = query("file=/repo/main.go");

        f.registry.watch(&q).unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(f.registry.inject(
            &q,
            event(EventKind::Create(CreateKind::File), Path::new("/repo/new.go"))
        ));

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(f.registry.is_watching(&q));
        assert_eq!(f.driver.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_event_triggers_one_update() {
        let f = fixture();
        let q = query("file=/repo/main.go");

        f.registry.watch(&q).unwrap();
        assert!(f.registry.inject(&q, write_event(Path::new("/repo/main.go"))));

        wait_for_calls(&f.driver, 1).await;
        for _ in 0..10 {
            settle().await;
        }

        assert_eq!(f.driver.calls(), 1);
        assert!(f.store.contains(&q).unwrap());
        f.registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_background_update_is_swallowed() {
        let f = fixture();
        let q = query("file=/repo/broken.go");
        f.driver.fail_pattern("file=/repo/broken.go");

        f.registry.watch(&q).unwrap();
        assert!(f.registry.inject(&q, write_event(Path::new("/repo/broken.go"))));
        wait_for_calls(&f.driver, 1).await;

        // The job survives and keeps processing events
        assert!(f.registry.is_watching(&q));
        assert!(f.registry.inject(&q, write_event(Path::new("/repo/broken.go"))));
        wait_for_calls(&f.driver, 2).await;
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_everything() {
        let f = fixture();

        for p in ["./a", "./b", "./c"] {
            f.registry.watch(&query(p)).unwrap();
        }
        assert_eq!(f.registry.len(), 3);

        f.registry.close().await;
        assert!(f.registry.is_empty());
        assert!(f.shared_tasks_done());

        assert!(matches!(
            f.registry.watch(&query("./a")),
            Err(WatchError::Closed)
        ));

        // Idempotent
        f.registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_result_follows_file_writes() {
        let f = fixture();
        let q = Query::new("/repo", vec!["./...".to_string(), "file=/repo/main.go".to_string()]);
        let timeout = Duration::from_secs(30);

        let d1 = f.store.get(&q, timeout).await.unwrap();
        f.registry.watch(&q).unwrap();
        assert_eq!(f.store.get(&q, timeout).await.unwrap(), d1);
        assert_eq!(f.driver.calls(), 1);

        assert!(f.registry.inject(&q, write_event(Path::new("/repo/main.go"))));
        wait_for_calls(&f.driver, 2).await;
        for _ in 0..10 {
            settle().await;
        }

        let d2 = f.store.get(&q, timeout).await.unwrap();
        assert_ne!(d1, d2);
        assert_eq!(d2, b"./... file=/repo/main.go #2");
        assert_eq!(f.driver.calls(), 2);
        f.registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_real_file_write_triggers_update() {
        let f = fixture();
        let src = tempdir().unwrap();
        let file: PathBuf = src.path().join("main.go");
        std::fs::write(&file, "package main\n").unwrap();

        let q = Query::new(
            src.path().to_string_lossy(),
            vec!["file=main.go".to_string()],
        );
        f.registry.watch(&q).unwrap();

        {
            use std::io::Write;
            let mut handle = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
            handle.write_all(b"\nfunc main() {}\n").unwrap();
            handle.sync_all().unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while f.driver.calls() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(f.driver.calls() >= 1, "write was not observed");
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_pending_extension_keeps_expiring_job() {
        let f = fixture();
        let q = query("./...");
        f.registry.watch(&q).unwrap();

        let key = key::encode(&q).into_string();
        let id = f.registry.shared.jobs.lock()[&key].id;

        // The extension landed just before the deadline fired
        let (tx, mut rx) = mpsc::channel::<()>(1);
        tx.try_send(()).unwrap();
        assert!(!f.registry.shared.expire(&key, id, &mut rx));
        assert!(f.registry.is_watching(&q));

        // Nothing pending: the job goes
        assert!(f.registry.shared.expire(&key, id, &mut rx));
        assert!(!f.registry.is_watching(&q));
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_expire_ignores_replaced_job() {
        let f = fixture();
        let q = query("./...");
        f.registry.watch(&q).unwrap();

        let key = key::encode(&q).into_string();
        let (_tx, mut rx) = mpsc::channel::<()>(1);
        assert!(f.registry.shared.expire(&key, u64::MAX, &mut rx));
        assert!(f.registry.is_watching(&q));
        f.registry.close().await;
    }

    impl Fixture {
        fn shared_tasks_done(&self) -> bool {
            self.registry.shared.tasks.is_empty()
        }
    }
}
