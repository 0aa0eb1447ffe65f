use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use models::{SessionRecord, SessionStatus};
use object_store::{ObjectStore, WatchEvent};
use tokio_util::sync::CancellationToken;

use crate::index::{parse_record, SessionIndex};
use crate::scheduler::Scheduler;

/// Bridges the object watch into the session index and the reaper.
///
/// Events are applied serially, in arrival order; the adapter is the only
/// writer of the index's derived fields. It also hosts single-shot "ready"
/// watchers, which the API registers *before* creating an object so that a
/// fast Ready transition cannot be missed.
pub struct WatchAdapter {
    index: Arc<SessionIndex>,
    reaper: Scheduler,
    ready_waiters: Mutex<HashMap<String, Vec<tokio::sync::oneshot::Sender<SessionRecord>>>>,
}

impl WatchAdapter {
    pub fn new(index: Arc<SessionIndex>, reaper: Scheduler) -> Arc<Self> {
        Arc::new(Self {
            index,
            reaper,
            ready_waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Register a single-shot watcher that fires when the named object is
    /// next observed Running. Must be called before the create is issued.
    pub fn watch_ready(&self, object_name: &str) -> tokio::sync::oneshot::Receiver<SessionRecord> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.ready_waiters
            .lock()
            .unwrap()
            .entry(object_name.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Drop any waiters for the named object; used when a create fails or
    /// a warm sandbox was claimed instead.
    pub fn cancel_watch(&self, object_name: &str) {
        self.ready_waiters.lock().unwrap().remove(object_name);
    }

    /// Apply one watch event. Serialized by the run loop.
    pub fn apply(&self, event: &WatchEvent) {
        let object = event.object();
        self.reaper.enqueue((
            object.meta.namespace.clone(),
            object.meta.name.clone(),
        ));

        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                // Objects with no session identity are not sessions.
                let Some(record) = parse_record(object) else {
                    tracing::debug!(name = %object.meta.name, "dropping object without session id");
                    return;
                };
                if record.status == SessionStatus::Running {
                    if let Some(waiters) =
                        self.ready_waiters.lock().unwrap().remove(&record.object_name)
                    {
                        for tx in waiters {
                            let _ = tx.send(record.clone());
                        }
                    }
                }
                self.index.set(record);
            }
            WatchEvent::Deleted(object) => {
                // A stale tombstone may carry only identity; remove by
                // whichever session id it parses to.
                if let Some(record) = parse_record(object) {
                    self.index.delete(&record.session_id);
                }
            }
        }
    }

    /// Consume the watch until shutdown. The initial snapshot is applied
    /// as synthetic Added events before any live event.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn ObjectStore>,
        namespace: String,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut watch = store
            .watch_sandboxes(&namespace)
            .await
            .context("establishing sandbox watch")?;

        for object in std::mem::take(&mut watch.snapshot) {
            self.apply(&WatchEvent::Added(object));
        }
        tracing::info!(namespace, sessions = self.index.len(), "session index synchronized");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = watch.events.recv() => {
                    let Some(event) = event else {
                        anyhow::bail!("sandbox watch closed unexpectedly");
                    };
                    self.apply(&event);
                }
            }
        }
    }
}
