//! The expensive computation behind the cache
//!
//! The cache only knows the [`Driver`] trait; [`GoListDriver`] is the default
//! implementation that shells out to `go list` and answers with a go/packages
//! driver response.

use crate::error::DriverError;
use crate::go_list;
use async_trait::async_trait;
use golist_types::{LoadMode, Query, FILE_PATTERN_PREFIX};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

/// Computes the result bytes for a query.
///
/// Implementations may be slow and may fail; the bytes are opaque to the
/// cache and handed to clients verbatim.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn compute(&self, query: &Query) -> Result<Vec<u8>, DriverError>;
}

/// Runs `go list -e -json` for a query and converts its output
#[derive(Debug, Clone)]
pub struct GoListDriver {
    program: String,
}

impl Default for GoListDriver {
    fn default() -> Self {
        Self {
            program: "go".to_string(),
        }
    }
}

impl GoListDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different `go` binary (e.g. a pinned toolchain)
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command line arguments for a query, without the program name
    pub fn args(query: &Query) -> Vec<String> {
        let mut args: Vec<String> = vec!["list".into(), "-e".into(), "-json".into()];

        if query.mode.contains(LoadMode::NEED_COMPILED_GO_FILES) {
            args.push("-compiled=true".into());
        }
        if query.mode.contains(LoadMode::NEED_DEPS) {
            args.push("-deps".into());
        }
        if query.mode.contains(LoadMode::NEED_EXPORT_FILE) {
            args.push("-export=true".into());
        }
        if query.tests {
            args.push("-test".into());
        }

        args.extend(query.build_flags.iter().cloned());
        args.push("--".into());

        let first_pattern = args.len();
        for pattern in query.patterns.iter().map(|p| package_pattern(p)) {
            if !args[first_pattern..].contains(&pattern) {
                args.push(pattern);
            }
        }

        args
    }

    fn parse_env(query: &Query) -> Result<Vec<(&str, &str)>, DriverError> {
        query
            .env
            .iter()
            .map(|entry| {
                entry
                    .split_once('=')
                    .filter(|(key, _)| !key.is_empty())
                    .ok_or_else(|| DriverError::InvalidQuery {
                        reason: format!("malformed environment entry: {entry}"),
                    })
            })
            .collect()
    }
}

/// `go list` has no notion of `file=` patterns; list the package of the
/// directory holding the file instead.
fn package_pattern(pattern: &str) -> String {
    let Some(file) = pattern.strip_prefix(FILE_PATTERN_PREFIX) else {
        return pattern.to_string();
    };

    match Path::new(file).parent() {
        Some(parent) if parent.is_absolute() => parent.to_string_lossy().into_owned(),
        Some(parent) if !parent.as_os_str().is_empty() => {
            let parent = parent.to_string_lossy();
            if parent.starts_with("./") || parent.starts_with("../") {
                parent.into_owned()
            } else {
                format!("./{parent}")
            }
        }
        _ => ".".to_string(),
    }
}

#[async_trait]
impl Driver for GoListDriver {
    async fn compute(&self, query: &Query) -> Result<Vec<u8>, DriverError> {
        if query.dir.is_empty() {
            return Err(DriverError::InvalidQuery {
                reason: "dir must not be empty".to_string(),
            });
        }

        let env = Self::parse_env(query)?;
        let args = Self::args(query);
        debug!(program = %self.program, dir = %query.dir, ?args, "Running driver");

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(&query.dir)
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| DriverError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DriverError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        trace!(bytes = output.stdout.len(), "Driver finished");
        let response = go_list::to_response(query, &output.stdout)?;
        serde_json::to_vec(&response).map_err(DriverError::InvalidOutput)
    }
}
