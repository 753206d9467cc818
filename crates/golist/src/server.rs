//! The golist daemon.
//!
//! Accepts one request per unix socket connection, serves compute requests
//! from the [`CacheStore`] and keeps their files watched. An exit request or
//! Ctrl-C shuts the daemon down: stop accepting, drain connections, close the
//! watchers and the store, remove the socket file.

use crate::protocol::{ProtocolError, Request, Response, Route};
use golist_core::{
    paths, CacheStore, Driver, StoreConfig, StoreError, WatcherConfig, WatcherRegistry,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept` so fd exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub store: StoreConfig,
    pub watcher: WatcherConfig,

    /// Deadline for serving one compute request
    pub request_timeout: Duration,

    /// How long shutdown waits for in-flight connections
    pub shutdown_grace: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: paths::socket_path(),
            store: StoreConfig::default(),
            watcher: WatcherConfig::default(),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Another golist daemon is already listening on {}", path.display())]
    AlreadyRunning { path: PathBuf },

    #[error("Failed to bind {}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to lock {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-connection state, cloned into each connection task
#[derive(Clone)]
struct Handler {
    store: Arc<CacheStore>,
    registry: Arc<WatcherRegistry>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

pub struct Server {
    config: DaemonConfig,
    handler: Handler,
    connections: TaskTracker,
}

impl Server {
    /// Open the store and build the daemon. Does not touch the socket yet.
    pub fn open(config: DaemonConfig, driver: Arc<dyn Driver>) -> Result<Self, ServerError> {
        let store = Arc::new(CacheStore::open(config.store.clone(), driver)?);
        let registry = Arc::new(WatcherRegistry::new(
            Arc::clone(&store),
            config.watcher.clone(),
        ));

        Ok(Self {
            handler: Handler {
                store,
                registry,
                shutdown: CancellationToken::new(),
                request_timeout: config.request_timeout,
            },
            config,
            connections: TaskTracker::new(),
        })
    }

    /// Token that stops [`Server::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.handler.shutdown.clone()
    }

    /// Serve until an exit request, Ctrl-C or the shutdown token.
    ///
    /// An exclusive lock on `<socket>.lock` is held from before the socket is
    /// bound until shutdown finishes, so two daemons starting together never
    /// both pass the stale-socket check.
    pub async fn run(&self) -> Result<(), ServerError> {
        let lock_path = lock_path(&self.config.socket_path);
        let mut lock = fd_lock::RwLock::new(open_lock_file(&lock_path)?);
        let _guard = match lock.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(ServerError::AlreadyRunning {
                    path: self.config.socket_path.clone(),
                })
            }
            Err(source) => {
                return Err(ServerError::Lock {
                    path: lock_path,
                    source,
                })
            }
        };

        let listener = bind(&self.config.socket_path).await?;
        info!(socket = %self.config.socket_path.display(), "golist daemon listening");

        self.spawn_refresh();

        let shutdown = self.handler.shutdown.clone();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Exit requested");
                    break;
                }
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("Interrupted"),
                        Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
                    }
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => self.spawn_connection(stream),
                        Err(e) => backoff_after_accept_error(&e).await,
                    }
                }
            }
        }

        drop(listener);
        self.shutdown().await;
        Ok(())
    }

    /// Refresh every stored entry once, in the background
    fn spawn_refresh(&self) {
        let store = Arc::clone(&self.handler.store);
        let shutdown = self.handler.shutdown.clone();

        self.connections.spawn(async move {
            let started = Instant::now();
            tokio::select! {
                () = shutdown.cancelled() => debug!("Startup refresh cancelled"),
                result = store.update_all() => match result {
                    Ok(report) => info!(
                        refreshed = report.refreshed,
                        pruned = report.pruned.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Startup refresh complete"
                    ),
                    Err(e) => error!(error = %e, "Startup refresh failed"),
                },
            }
        });
    }

    fn spawn_connection(&self, stream: UnixStream) {
        let handler = self.handler.clone();
        self.connections.spawn(async move {
            if let Err(e) = handler.serve(stream).await {
                debug!(error = %e, "Connection error");
            }
        });
    }

    async fn shutdown(&self) {
        self.handler.shutdown.cancel();

        if let Err(e) = tokio::fs::remove_file(&self.config.socket_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to remove socket file");
            }
        }

        self.connections.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.connections.wait())
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Connections still running after grace period"
            );
        }

        info!("Closing watchers");
        self.handler.registry.close().await;

        if let Err(e) = self.handler.store.close() {
            error!(error = %e, "Failed to close cache store");
        }
        info!("golist daemon stopped");
    }
}

impl Handler {
    async fn serve(&self, mut stream: UnixStream) -> Result<(), ProtocolError> {
        let request = match Request::read_from(&mut stream).await {
            Ok(request) => request,
            Err(e) if e.is_rejectable() => {
                warn!(error = %e, "Rejecting malformed request");
                return Response::rejected(e.to_string()).write_to(&mut stream).await;
            }
            Err(e) => return Err(e),
        };

        match request.route {
            Route::Exit => {
                Response::ok(Vec::new()).write_to(&mut stream).await?;
                self.shutdown.cancel();
                Ok(())
            }
            Route::Compute => {
                let query = match request.query() {
                    Ok(query) => query,
                    Err(e) => {
                        warn!(error = %e, "Rejecting malformed query");
                        return Response::rejected(e.to_string()).write_to(&mut stream).await;
                    }
                };

                debug!(
                    patterns = ?query.patterns,
                    mode = %query.mode,
                    tests = query.tests,
                    "Compute request"
                );
                let started = Instant::now();

                match self.store.get(&query, self.request_timeout).await {
                    Ok(bytes) => {
                        Response::ok(bytes).write_to(&mut stream).await?;
                        info!(
                            patterns = ?query.patterns,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Served"
                        );
                        if let Err(e) = self.registry.watch(&query) {
                            warn!(error = %e, "Failed to watch query files");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, patterns = ?query.patterns, "Compute failed");
                        Response::error(e.to_string()).write_to(&mut stream).await?;
                    }
                }
                Ok(())
            }
        }
    }
}

async fn backoff_after_accept_error(e: &io::Error) {
    warn!(
        error = %e,
        backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
        "Failed to accept connection"
    );
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

fn lock_path(socket: &Path) -> PathBuf {
    let mut name = socket.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Open (never truncate or delete) the daemon lock file
fn open_lock_file(path: &Path) -> Result<File, ServerError> {
    let lock_err = |source| ServerError::Lock {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(lock_err)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(lock_err)
}

/// Bind the socket, clearing a stale file left by a dead daemon.
///
/// Callers must hold the daemon lock.
async fn bind(path: &Path) -> Result<UnixListener, ServerError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ServerError::Bind {
                path: path.to_path_buf(),
                source,
            })?;
    }

    if path.exists() {
        match UnixStream::connect(path).await {
            Ok(_) => {
                return Err(ServerError::AlreadyRunning {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                debug!(error = %e, socket = %path.display(), "Removing stale socket");
                let _ = tokio::fs::remove_file(path).await;
            }
        }
    }

    UnixListener::bind(path).map_err(|source| ServerError::Bind {
        path: path.to_path_buf(),
        source,
    })
}
