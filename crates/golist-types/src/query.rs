//! Query model
//!
//! A `Query` describes one `go list` invocation. Field order is fixed and every
//! collection is an ordered `Vec`, so serializing the same query always yields
//! the same bytes.

use crate::mode::LoadMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pattern prefix naming a single file instead of a package path
pub const FILE_PATTERN_PREFIX: &str = "file=";

/// A request whose `go list` result is cached
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    /// Requested package fields
    pub mode: LoadMode,

    /// Package patterns, in the order given by the caller
    pub patterns: Vec<String>,

    /// Working directory the query runs in
    pub dir: String,

    /// Extra environment entries (`KEY=VALUE`), order preserved
    pub env: Vec<String>,

    /// Flags forwarded to the build tool
    pub build_flags: Vec<String>,

    /// Include test packages
    pub tests: bool,
}

impl Query {
    pub fn new(dir: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            patterns,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: LoadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_build_flags(mut self, build_flags: Vec<String>) -> Self {
        self.build_flags = build_flags;
        self
    }

    pub fn with_tests(mut self, tests: bool) -> Self {
        self.tests = tests;
        self
    }

    /// Files named explicitly through `file=` patterns, as written
    pub fn file_patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns
            .iter()
            .filter_map(|p| p.strip_prefix(FILE_PATTERN_PREFIX))
            .filter(|f| !f.is_empty())
    }

    /// Paths a watcher should observe for this query.
    ///
    /// Relative `file=` paths are resolved against `dir`.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        let dir = Path::new(&self.dir);
        self.file_patterns()
            .map(|file| {
                let path = Path::new(file);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    dir.join(path)
                }
            })
            .collect()
    }
}

/// Request body go/packages writes to a driver's stdin.
///
/// Unknown fields such as `overlay` are ignored: `go list` cannot consume
/// overlays and a map would break deterministic keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverRequest {
    pub mode: LoadMode,
    pub env: Vec<String>,
    pub build_flags: Vec<String>,
    pub tests: bool,
}

impl DriverRequest {
    /// Combine the stdin request with the CLI patterns and working directory
    pub fn into_query(self, dir: impl Into<String>, patterns: Vec<String>) -> Query {
        Query::new(dir, patterns)
            .with_mode(self.mode)
            .with_env(self.env)
            .with_build_flags(self.build_flags)
            .with_tests(self.tests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_patterns() {
        let query = Query::new(
            "/repo",
            vec![
                "./...".to_string(),
                "file=main.go".to_string(),
                "file=/abs/lib.go".to_string(),
                "file=".to_string(),
            ],
        );

        let files: Vec<_> = query.file_patterns().collect();
        assert_eq!(files, vec!["main.go", "/abs/lib.go"]);
    }

    #[test]
    fn test_watch_paths_resolve_against_dir() {
        let query = Query::new(
            "/repo",
            vec!["file=cmd/main.go".to_string(), "file=/abs/lib.go".to_string()],
        );

        assert_eq!(
            query.watch_paths(),
            vec![PathBuf::from("/repo/cmd/main.go"), PathBuf::from("/abs/lib.go")]
        );
    }

    #[test]
    fn test_no_file_patterns_means_no_paths() {
        let query = Query::new("/repo", vec!["./...".to_string()]);
        assert!(query.watch_paths().is_empty());
    }

    #[test]
    fn test_driver_request_into_query() {
        let json = r#"{
            "mode": 17,
            "env": ["GOOS=linux"],
            "build_flags": ["-tags=integration"],
            "tests": true,
            "overlay": {"/repo/a.go": "cGFja2FnZSBh"}
        }"#;
        let request: DriverRequest = serde_json::from_str(json).unwrap();
        let query = request.into_query("/repo", vec!["./...".to_string()]);

        assert_eq!(query.mode, LoadMode::NEED_NAME | LoadMode::NEED_DEPS);
        assert_eq!(query.env, vec!["GOOS=linux"]);
        assert_eq!(query.build_flags, vec!["-tags=integration"]);
        assert!(query.tests);
        assert_eq!(query.dir, "/repo");
    }

    #[test]
    fn test_driver_request_defaults() {
        let request: DriverRequest = serde_json::from_str("{}").unwrap();
        let query = request.into_query("/repo", vec![]);
        assert_eq!(query, Query::new("/repo", vec![]));
    }
}
