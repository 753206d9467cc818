//! Caching layer for golist-core
//!
//! Durable SQLite store with per-key single-flight computation.

mod key_lock;
pub mod store;

pub use store::{CacheStats, CacheStore, PrunedEntry, RefreshReport, StoreConfig};
