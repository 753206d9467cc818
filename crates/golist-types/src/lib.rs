//! golist-types - Shared data types for golist
//!
//! This crate contains pure data structures without heavy dependencies.
//! No tokio, no async runtime - just serde-serializable types.
//!
//! Used by:
//! - golist-core (key codec, cache store, watchers)
//! - golist (daemon, client and CLI)

pub mod mode;
pub mod query;
pub mod response;

pub use mode::LoadMode;
pub use query::{DriverRequest, Query, FILE_PATTERN_PREFIX};
pub use response::{DriverResponse, Package, PackageError, LIST_ERROR};
