//! Error types for golist-core
//!
//! One thiserror enum per subsystem. `CacheError` is what foreground callers
//! see; background paths (bulk refresh, watch jobs) log and swallow.

use std::path::PathBuf;
use thiserror::Error;

/// A stored key that `key::decode` could not turn back into a query
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Cache key is not valid base64")]
    Base64(#[from] base64::DecodeError),

    #[error("Cache key does not contain a valid query: {0}")]
    Json(#[from] serde_json::Error),
}

/// Storage engine failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open cache database: {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to create cache directory: {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cache database is closed")]
    Closed,
}

/// Failures of the external `go list` computation
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },

    #[error("Unreadable go list output")]
    InvalidOutput(#[source] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by `CacheStore::get` and `CacheStore::update`
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Operation timed out after {timeout_secs}s: {operation}")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },
}

impl CacheError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CacheError::Timeout { .. })
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Store(StoreError::Sqlite(e))
    }
}

/// Watch registry failures
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Watcher registry is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = CacheError::Timeout {
            operation: "get ./...".to_string(),
            timeout_secs: 30,
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Operation timed out after 30s: get ./...");
    }

    #[test]
    fn test_driver_error_is_transparent() {
        let err: CacheError = DriverError::Other("go: cannot find main module".into()).into();
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "go: cannot find main module");
    }

    #[test]
    fn test_sqlite_error_converts_to_store() {
        let err: CacheError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, CacheError::Store(StoreError::Sqlite(_))));
    }
}
