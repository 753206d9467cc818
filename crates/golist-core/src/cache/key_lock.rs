//! Per-key async mutual exclusion
//!
//! Callers for the same key queue on one `tokio::sync::Mutex`; callers for
//! different keys never touch each other's lock. Entries are dropped from the
//! map once the last holder or waiter lets go, so the map only holds keys
//! that are currently being computed.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub(crate) struct KeyLocks {
    inflight: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait until this caller owns `key`
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;

        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a holder or waiters
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inflight.len()
    }
}

/// Ownership of one key; released on drop
pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release first so the Arc held by the guard is gone before counting.
        self.guard.take();
        self.locks
            .inflight
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
