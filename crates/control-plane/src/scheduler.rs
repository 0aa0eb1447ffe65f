use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

/// Identifies one reconciled object: `(namespace, name)`.
pub type Key = (String, String);

/// Backoff applied when a reconcile returns an error.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// A per-object reconciler. Returning `Ok(Some(d))` schedules the next
/// reconcile of the same key after `d`; `Ok(None)` leaves it idle until
/// the next watch event; errors requeue with [`ERROR_BACKOFF`].
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Duration>>;
}

/// Handle for enqueueing reconcile work.
#[derive(Clone)]
pub struct Scheduler {
    tx: tokio::sync::mpsc::UnboundedSender<(Key, Duration)>,
}

impl Scheduler {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<(Key, Duration)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, key: Key) {
        self.enqueue_after(key, Duration::ZERO);
    }

    pub fn enqueue_after(&self, key: Key, after: Duration) {
        // Send fails only after the run loop has stopped, during shutdown.
        let _ = self.tx.send((key, after));
    }
}

/// Drive reconciles with per-key single-flight admission: at most one
/// reconcile is in flight per key, and an enqueue for a key that is
/// already queued or in flight is dropped.
pub async fn run<R: Reconcile>(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<(Key, Duration)>,
    reconciler: Arc<R>,
    shutdown: CancellationToken,
) {
    let mut delay_queue: DelayQueue<Key> = DelayQueue::new();
    let mut queued: HashMap<Key, tokio_util::time::delay_queue::Key> = HashMap::new();
    let mut running: HashSet<Key> = HashSet::new();
    let mut in_flight = tokio::task::JoinSet::new();

    loop {
        // A drained DelayQueue yields None immediately; park it instead.
        let next_expired = async {
            if delay_queue.is_empty() {
                futures::future::pending::<()>().await;
            }
            futures::future::poll_fn(|cx| delay_queue.poll_expired(cx)).await
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,

            message = rx.recv() => {
                let Some((key, after)) = message else { break };
                if queued.contains_key(&key) || running.contains(&key) {
                    tracing::debug!(namespace = %key.0, name = %key.1, "dropping duplicate enqueue");
                    continue;
                }
                let dq_key = delay_queue.insert(key.clone(), after);
                queued.insert(key, dq_key);
            }

            Some(expired) = next_expired => {
                let key = expired.into_inner();
                queued.remove(&key);
                running.insert(key.clone());

                let reconciler = reconciler.clone();
                in_flight.spawn(async move {
                    let result = reconciler.reconcile(&key.0, &key.1).await;
                    (key, result)
                });
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                let (key, result) = match joined {
                    Ok(done) => done,
                    Err(join_err) => {
                        tracing::error!(%join_err, "reconcile task panicked");
                        continue;
                    }
                };
                running.remove(&key);

                match result {
                    Ok(Some(requeue)) => {
                        let dq_key = delay_queue.insert(key.clone(), requeue);
                        queued.insert(key, dq_key);
                    }
                    Ok(None) => (),
                    Err(err) => {
                        tracing::warn!(
                            namespace = %key.0,
                            name = %key.1,
                            error = format!("{err:#}"),
                            "reconcile failed, backing off",
                        );
                        let dq_key = delay_queue.insert(key.clone(), ERROR_BACKOFF);
                        queued.insert(key, dq_key);
                    }
                }
            }
        }
    }

    in_flight.shutdown().await;
}
