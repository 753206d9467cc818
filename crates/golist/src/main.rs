//! golist - caching go/packages driver

use anyhow::{Context, Result};
use clap::Parser;
use golist::{logging, Client, DaemonConfig, Launcher, Server};
use golist_core::{paths, GoListDriver, StoreConfig, WatcherConfig};
use golist_types::{DriverRequest, Query};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Parser)]
#[command(
    name = "golist",
    version,
    about = "Caching go/packages driver backed by a local daemon",
    long_about = "A go/packages driver that answers `go list` queries from a local cache.\n\
                  \n\
                  Point GOPACKAGESDRIVER at this binary. Each invocation reads the driver\n\
                  request from stdin, asks the daemon for the result and prints it. The\n\
                  daemon is started on first use and re-runs cached queries when the files\n\
                  they name change.\n\
                  \n\
                  Examples:\n\
                    golist ./...                     # Query through the daemon\n\
                    golist --serve --verbose         # Run the daemon in the foreground\n\
                    golist --exit                    # Stop the daemon\n\
                  \n\
                  Environment Variables:\n\
                    GOLIST_SOCKET                    # Override the daemon socket path\n\
                    GOLIST_DB                        # Override the cache database path\n\
                    GOLIST_WATCH_TTL_SECS            # Idle lifetime of file watchers\n\
                    GOLIST_LOG                       # Tracing filter (e.g. golist=trace)"
)]
struct Cli {
    /// Package patterns, as go/packages passes them
    patterns: Vec<String>,

    /// Run the daemon in the foreground
    #[arg(short, long)]
    serve: bool,

    /// Stop a running daemon
    #[arg(long, conflicts_with = "serve")]
    exit: bool,

    /// Enable debug logs
    #[arg(short, long)]
    verbose: bool,

    /// Unix socket of the daemon
    #[arg(long, env = "GOLIST_SOCKET")]
    socket: Option<PathBuf>,

    /// Cache database file (daemon only)
    #[arg(long, env = "GOLIST_DB")]
    db: Option<PathBuf>,

    /// Seconds a watcher lives without requests or file activity (daemon only)
    #[arg(long, env = "GOLIST_WATCH_TTL_SECS")]
    watch_ttl_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let socket = cli.socket.clone().unwrap_or_else(paths::socket_path);

    if cli.serve {
        return serve(&cli, socket).await;
    }

    if cli.exit {
        return Client::new(socket)
            .exit()
            .await
            .context("Failed to stop golist daemon");
    }

    let dir = std::env::current_dir().context("Cannot determine working directory")?;
    let query = read_query(tokio::io::stdin(), &dir.to_string_lossy(), &cli.patterns).await?;
    let client = Client::new(socket).with_launcher(launcher(&cli)?);
    let bytes = client.request(&query).await?;

    write_result(tokio::io::stdout(), &bytes).await
}

async fn serve(cli: &Cli, socket: PathBuf) -> Result<()> {
    let mut watcher = WatcherConfig::default();
    if let Some(secs) = cli.watch_ttl_secs {
        watcher.ttl = Duration::from_secs(secs);
    }

    let config = DaemonConfig {
        socket_path: socket,
        store: cli
            .db
            .clone()
            .map(StoreConfig::new)
            .unwrap_or_default(),
        watcher,
        ..Default::default()
    };
    tracing::debug!(db = %config.store.path.display(), "Opening cache store");

    let server = Server::open(config, Arc::new(GoListDriver::new()))
        .context("Failed to open cache store")?;
    server.run().await.context("golist daemon failed")?;

    Ok(())
}

/// Daemon command line for on-demand launch. Flags given explicitly are
/// forwarded; environment variables are inherited anyway.
fn launcher(cli: &Cli) -> Result<Launcher> {
    let mut launcher = Launcher::current_exe().context("Cannot locate golist executable")?;

    if let Some(socket) = &cli.socket {
        launcher = launcher.arg("--socket").arg(socket);
    }
    if let Some(db) = &cli.db {
        launcher = launcher.arg("--db").arg(db);
    }
    if let Some(secs) = cli.watch_ttl_secs {
        launcher = launcher.arg("--watch-ttl-secs").arg(secs.to_string());
    }
    if cli.verbose {
        launcher = launcher.arg("--verbose");
    }

    Ok(launcher)
}

/// Build the query from the driver request on `input` (stdin) and `dir`
async fn read_query<R: AsyncRead + Unpin>(
    mut input: R,
    dir: &str,
    patterns: &[String],
) -> Result<Query> {
    let mut text = String::new();
    input
        .read_to_string(&mut text)
        .await
        .context("Failed to read driver request from stdin")?;

    let request: DriverRequest = if text.trim().is_empty() {
        DriverRequest::default()
    } else {
        serde_json::from_str(&text).context("Invalid driver request on stdin")?
    };

    Ok(request.into_query(dir, patterns.to_vec()))
}

async fn write_result<W: AsyncWrite + Unpin>(mut out: W, bytes: &[u8]) -> Result<()> {
    out.write_all(bytes).await.context("Failed to write result")?;
    out.flush().await?;
    Ok(())
}
