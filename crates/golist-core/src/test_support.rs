use crate::driver::Driver;
use crate::error::DriverError;
use async_trait::async_trait;
use golist_types::Query;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Driver stub that counts calls and answers `"<patterns> #<call>"`
pub(crate) struct StubDriver {
    calls: AtomicUsize,
    delay: Duration,
    failing: Mutex<HashSet<String>>,
}

impl StubDriver {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fail every query containing `pattern` from now on
    pub(crate) fn fail_pattern(&self, pattern: &str) {
        self.failing.lock().insert(pattern.to_string());
    }
}

#[async_trait]
impl Driver for StubDriver {
    async fn compute(&self, query: &Query) -> Result<Vec<u8>, DriverError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = {
            let failing = self.failing.lock();
            query.patterns.iter().any(|p| failing.contains(p))
        };
        if failing {
            return Err(DriverError::Other(format!("stub failure #{call}")));
        }

        Ok(format!("{} #{}", query.patterns.join(" "), call).into_bytes())
    }
}
