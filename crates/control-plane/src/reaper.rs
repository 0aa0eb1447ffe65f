use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use object_store::ObjectStore;

use crate::scheduler::Reconcile;

/// How long a sandbox may sit without tunnel activity before it is reaped.
pub const SESSION_EXPIRATION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Deletes sandboxes whose idle time has exceeded the session timeout.
///
/// Runs under the control plane's system identity: users own their
/// sandboxes, background reconciliation does not act on their behalf.
pub struct Reaper {
    store: Arc<dyn ObjectStore>,
    session_timeout: chrono::Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_timeout(store, SESSION_EXPIRATION_TIMEOUT)
    }

    pub fn with_timeout(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self {
            store,
            session_timeout: chrono::Duration::from_std(timeout)
                .expect("session timeout fits chrono::Duration"),
        }
    }
}

#[async_trait::async_trait]
impl Reconcile for Reaper {
    #[tracing::instrument(skip(self))]
    async fn reconcile(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Duration>> {
        let sandbox = match self.store.get_sandbox(namespace, name).await {
            Ok(sandbox) => sandbox,
            // Already gone: deletion raced us, and that is success.
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err).context("fetching sandbox"),
        };

        let last_activity = match sandbox.meta.annotation(models::ANNOTATION_LAST_ACTIVITY) {
            // Newly registered; activity will arrive.
            None | Some("") => return Ok(None),
            Some(raw) => chrono::DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("malformed {} annotation {raw:?}", models::ANNOTATION_LAST_ACTIVITY))?
                .with_timezone(&chrono::Utc),
        };

        let elapsed = chrono::Utc::now() - last_activity;
        let remaining = self.session_timeout - elapsed;

        if remaining <= chrono::Duration::zero() {
            tracing::info!(
                namespace,
                name,
                idle = %humantime_duration(elapsed),
                "reaping idle sandbox",
            );
            match self.store.delete_sandbox(namespace, name).await {
                Ok(()) => Ok(None),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err).context("deleting expired sandbox"),
            }
        } else {
            // A future timestamp lands here too: far from expiration.
            Ok(Some(
                remaining.to_std().expect("positive remaining duration"),
            ))
        }
    }
}

fn humantime_duration(d: chrono::Duration) -> String {
    match d.to_std() {
        Ok(d) => humantime::format_duration(Duration::from_secs(d.as_secs())).to_string(),
        Err(_) => format!("{d}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use object_store::{MemoryStore, ObjectMeta, SandboxObject};

    async fn seed(store: &MemoryStore, name: &str, last_activity: Option<String>) {
        let mut sandbox = SandboxObject {
            meta: ObjectMeta {
                name: name.to_string(),
                namespace: "ns".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        if let Some(at) = last_activity {
            sandbox
                .meta
                .annotations
                .insert(models::ANNOTATION_LAST_ACTIVITY.to_string(), at);
        }
        store.create_sandbox(sandbox).await.unwrap();
    }

    fn rfc3339(offset: chrono::Duration) -> String {
        (chrono::Utc::now() + offset).to_rfc3339()
    }

    #[tokio::test]
    async fn test_missing_object_is_success() {
        let store = MemoryStore::new();
        let reaper = Reaper::new(store);
        assert_eq!(reaper.reconcile("ns", "gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_annotation_is_noop() {
        let store = MemoryStore::new();
        seed(&store, "sb", None).await;
        let reaper = Reaper::new(store.clone());
        assert_eq!(reaper.reconcile("ns", "sb").await.unwrap(), None);
        assert!(store.get_sandbox("ns", "sb").await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_annotation_errors() {
        let store = MemoryStore::new();
        seed(&store, "sb", Some("not-a-time".to_string())).await;
        let reaper = Reaper::new(store);
        assert!(reaper.reconcile("ns", "sb").await.is_err());
    }

    #[tokio::test]
    async fn test_idle_past_timeout_deletes() {
        let store = MemoryStore::new();
        // Exactly at the boundary the tie-break deletes.
        seed(&store, "sb", Some(rfc3339(-chrono::Duration::minutes(15)))).await;
        let reaper = Reaper::new(store.clone());
        assert_eq!(reaper.reconcile("ns", "sb").await.unwrap(), None);
        assert!(store.get_sandbox("ns", "sb").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_active_requeues_at_remaining() {
        let store = MemoryStore::new();
        seed(&store, "sb", Some(rfc3339(-chrono::Duration::minutes(14)))).await;
        let reaper = Reaper::new(store.clone());
        let requeue = reaper.reconcile("ns", "sb").await.unwrap().unwrap();
        // Within a second of one minute out.
        assert!(requeue <= Duration::from_secs(60), "requeue {requeue:?}");
        assert!(requeue >= Duration::from_secs(58), "requeue {requeue:?}");
        assert!(store.get_sandbox("ns", "sb").await.is_ok());
    }

    #[tokio::test]
    async fn test_future_timestamp_requeues() {
        let store = MemoryStore::new();
        seed(&store, "sb", Some(rfc3339(chrono::Duration::minutes(5)))).await;
        let reaper = Reaper::new(store.clone());
        let requeue = reaper.reconcile("ns", "sb").await.unwrap();
        assert!(requeue.unwrap() > Duration::from_secs(15 * 60));
        assert!(store.get_sandbox("ns", "sb").await.is_ok());
    }
}
