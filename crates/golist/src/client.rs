//! Client side of the daemon protocol, with on-demand daemon launch.

use crate::protocol::{ProtocolError, Request, Response, Status};
use golist_core::paths;
use golist_types::Query;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Cannot reach golist daemon at {}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start golist daemon")]
    Launch(#[source] io::Error),

    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The daemon ran the query and it failed
    #[error("{0}")]
    Server(String),

    #[error("Request rejected by golist daemon: {0}")]
    Rejected(String),
}

/// Starts a detached daemon process
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Launcher {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `<this executable> --serve`
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, ["--serve"]))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Spawn without waiting. The daemon gets its own process group so it
    /// outlives the client and ignores the client's Ctrl-C.
    pub fn spawn(&self) -> io::Result<()> {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;
        info!(pid = child.id(), program = %self.program.display(), "Started golist daemon");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
    timeout: Duration,
    launcher: Option<Launcher>,
    launch_delay: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(paths::socket_path())
    }
}

impl Client {
    /// Client for the daemon at `socket_path`; never launches one
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(30),
            launcher: None,
            launch_delay: Duration::from_secs(2),
        }
    }

    /// Launch a daemon when the first connection fails
    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait between launching the daemon and the single retry
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Run `query` through the daemon, starting it if needed.
    pub async fn request(&self, query: &Query) -> Result<Vec<u8>, ClientError> {
        let request = Request::compute(query)?;

        let response = match self.send(&request).await {
            Err(ClientError::Connect { source, .. }) if self.launcher.is_some() => {
                debug!(error = %source, "golist daemon not reachable, launching");
                if let Some(launcher) = &self.launcher {
                    launcher.spawn().map_err(ClientError::Launch)?;
                }
                tokio::time::sleep(self.launch_delay).await;
                self.send(&request).await?
            }
            other => other?,
        };

        match response.status {
            Status::Ok => Ok(response.body),
            Status::Error => Err(ClientError::Server(response.message())),
            Status::Rejected => Err(ClientError::Rejected(response.message())),
        }
    }

    /// Ask the daemon to stop. A daemon that isn't running counts as stopped.
    pub async fn exit(&self) -> Result<(), ClientError> {
        match self.send(&Request::exit()).await {
            Ok(_) => Ok(()),
            Err(ClientError::Connect { .. }) => {
                debug!(socket = %self.socket_path.display(), "golist daemon already stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|source| {
                ClientError::Connect {
                    path: self.socket_path.clone(),
                    source,
                }
            })?;
            request.write_to(&mut stream).await?;
            Ok::<_, ClientError>(Response::read_from(&mut stream).await?)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }
}
