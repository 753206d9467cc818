//! golist-core - Core library for golist
//!
//! Provides the cache key codec, the durable result store, the `go list`
//! driver and the file watchers that keep cached results fresh.

pub mod cache;
pub mod driver;
pub mod error;
pub mod go_list;
pub mod key;
pub mod paths;
pub mod watcher;

#[cfg(test)]
mod test_support;

pub use cache::{CacheStats, CacheStore, PrunedEntry, RefreshReport, StoreConfig};
pub use driver::{Driver, GoListDriver};
pub use error::{CacheError, DriverError, KeyError, StoreError, WatchError};
pub use key::CacheKey;
pub use watcher::{WatcherConfig, WatcherRegistry};
