//! Tracing setup for the golist binary
//!
//! Logs go to stderr; stdout is reserved for result bytes.

use anyhow::{Context, Result};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable that overrides the log filter
pub const LOG_ENV: &str = "GOLIST_LOG";

/// Filter used when `GOLIST_LOG` is unset: our crates at `debug` with
/// `--verbose`, everything else at `warn`.
pub fn default_directive(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "warn" };
    format!("warn,golist={level},golist_core={level}")
}

pub fn init(verbose: bool) -> Result<()> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(&directive)
            .with_context(|| format!("Invalid {LOG_ENV} filter: {directive}"))?,
        _ => EnvFilter::try_new(default_directive(verbose))
            .context("Failed to create tracing filter")?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}
