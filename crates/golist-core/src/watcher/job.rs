//! A single watch job: one notify watcher plus two tasks.
//!
//! - the timer task owns the TTL deadline and decides when the job dies
//! - the event task turns write events into cache updates
//!
//! Both exit when the job's cancellation token fires, which happens exactly
//! once: when the [`JobHandle`] is dropped.

use super::Shared;
use golist_types::Query;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

pub(crate) type EventResult = notify::Result<Event>;

/// Registry-side handle of a running job. Dropping it stops observation
/// and cancels both tasks.
pub(crate) struct JobHandle {
    pub(crate) id: u64,
    extend_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    _watcher: RecommendedWatcher,
    #[cfg(test)]
    pub(crate) events_tx: mpsc::Sender<EventResult>,
}

impl JobHandle {
    pub(crate) fn new(
        id: u64,
        extend_tx: mpsc::Sender<()>,
        cancel: CancellationToken,
        watcher: RecommendedWatcher,
        #[cfg(test)] events_tx: mpsc::Sender<EventResult>,
    ) -> Self {
        Self {
            id,
            extend_tx,
            cancel,
            _watcher: watcher,
            #[cfg(test)]
            events_tx,
        }
    }

    /// Ask the timer task to push the deadline back. Coalesces: if an
    /// extension is already pending this one is dropped.
    pub(crate) fn request_extension(&self) {
        let _ = self.extend_tx.try_send(());
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Everything the two tasks of a job need
pub(crate) struct JobTasks {
    pub(crate) id: u64,
    pub(crate) key: String,
    pub(crate) query: Query,
    pub(crate) extend_tx: mpsc::Sender<()>,
    pub(crate) extend_rx: mpsc::Receiver<()>,
    pub(crate) events_rx: mpsc::Receiver<EventResult>,
    pub(crate) cancel: CancellationToken,
}

impl JobTasks {
    pub(crate) fn spawn(self, shared: &Arc<Shared>) {
        let JobTasks {
            id,
            key,
            query,
            extend_tx,
            extend_rx,
            events_rx,
            cancel,
        } = self;

        shared.tasks.spawn(run_timer(
            Arc::clone(shared),
            key,
            id,
            extend_rx,
            cancel.clone(),
        ));
        shared.tasks.spawn(run_events(
            Arc::clone(shared),
            query,
            extend_tx,
            events_rx,
            cancel,
        ));
    }
}

async fn run_timer(
    shared: Arc<Shared>,
    key: String,
    id: u64,
    mut extend_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let ttl = shared.config.ttl;
    let deadline = tokio::time::sleep(ttl);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(()) = extend_rx.recv() => {
                trace!(job = id, "Extending deadline");
                deadline.as_mut().reset(Instant::now() + ttl);
            }
            () = &mut deadline => {
                if !shared.expire(&key, id, &mut extend_rx) {
                    trace!(job = id, "Extended at the deadline");
                    deadline.as_mut().reset(Instant::now() + ttl);
                    continue;
                }
                debug!(job = id, "Watch expired, job removed");
                break;
            }
        }
    }
}

async fn run_events(
    shared: Arc<Shared>,
    query: Query,
    extend_tx: mpsc::Sender<()>,
    mut events_rx: mpsc::Receiver<EventResult>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events_rx.recv() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                error!(error = %e, patterns = ?query.patterns, "File watcher error");
                continue;
            }
            None => break,
        };

        trace!(?event, "File event");
        let _ = extend_tx.try_send(());

        // Create and rename are ignored: the watched set is fixed per job.
        if !is_write(&event.kind) {
            continue;
        }

        debug!(paths = ?event.paths, patterns = ?query.patterns, "File changed, updating");
        tokio::select! {
            () = cancel.cancelled() => break,
            result = shared.store.update(&query, shared.config.refresh_timeout) => {
                if let Err(e) = result {
                    error!(error = %e, patterns = ?query.patterns, "Background update failed");
                }
            }
        }
    }
}

/// Content writes only; metadata and name changes don't count
pub(crate) fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RenameMode};

    #[test]
    fn test_is_write() {
        assert!(is_write(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
        assert!(is_write(&EventKind::Modify(ModifyKind::Any)));

        assert!(!is_write(&EventKind::Create(CreateKind::File)));
        assert!(!is_write(&EventKind::Modify(ModifyKind::Name(
            RenameMode::Both
        ))));
        assert!(!is_write(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_write(&EventKind::Remove(
            notify::event::RemoveKind::File
        )));
    }
}
