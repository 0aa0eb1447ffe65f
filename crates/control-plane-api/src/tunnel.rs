//! The HTTP CONNECT-to-TCP bridge between a user and their sandbox pod.
//! The inbound connection is upgraded once the backend leg is dialed, then
//! bytes are proxied both ways with write-half-close semantics so either
//! peer can finish sending while the other direction drains.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use hyper_util::rt::TokioIo;
use object_store::{ClientFactory, ObjectStore, PodObject, PodPhase, Selector};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::{ApiError, App, Identity};

/// How often a live tunnel re-stamps session activity, so long-lived
/// connections do not appear idle to the reaper.
const ACTIVITY_INTERVAL: Duration = Duration::from_secs(60);

#[tracing::instrument(skip_all, fields(session_id = %id, principal = %identity.principal))]
pub async fn tunnel(
    app: Arc<App>,
    identity: Identity,
    id: String,
    mut req: axum::extract::Request,
) -> Result<axum::response::Response, ApiError> {
    let record = app
        .index
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("sandbox {id} not found")))?;
    if !app.policy.allows(&record.creator_principal, &identity.principal) {
        return Err(ApiError::forbidden("caller does not own this sandbox"));
    }

    let store = app.factory.system_client();
    let pod = resolve_pod(store.as_ref(), &record.namespace, &record.object_name).await?;
    let pod_ip = match (&pod.phase, &pod.pod_ip) {
        (PodPhase::Running, Some(ip)) if !ip.is_empty() => ip.clone(),
        _ => {
            return Err(ApiError::bad_gateway(format!(
                "pod for sandbox {} is not running yet",
                record.object_name
            )))
        }
    };

    let address = format!("{pod_ip}:{}", app.config.in_pod_port);
    let backend = tokio::time::timeout(app.config.connect_timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| ApiError::bad_gateway(format!("timed out dialing {address}")))?
        .map_err(|err| ApiError::bad_gateway(format!("dialing {address} failed: {err}")))?;

    stamp_activity(&app, &record.namespace, &record.object_name, &id).await;

    let on_upgrade = hyper::upgrade::on(&mut req);
    let session_id = id.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(err) => {
                tracing::warn!(%err, "tunnel upgrade failed");
                return;
            }
        };
        run_tunnel(app, upgraded, backend, record.namespace, record.object_name, session_id).await;
    });

    // hyper completes the upgrade once this 200 goes out.
    Ok(StatusCode::OK.into_response())
}

/// Resolve the backing pod: exact name first, then the sandbox-name label,
/// then the orchestrator's native label, and finally an owner-reference
/// scan over the namespace.
async fn resolve_pod(
    store: &dyn ObjectStore,
    namespace: &str,
    sandbox_name: &str,
) -> Result<PodObject, ApiError> {
    match store.get_pod(namespace, sandbox_name).await {
        Ok(pod) => return Ok(pod),
        Err(err) if err.is_not_found() => (),
        Err(err) => return Err(err.into()),
    }

    for selector in [
        Selector::label(models::LABEL_SANDBOX_NAME, sandbox_name),
        Selector::label(models::LABEL_NATIVE_SANDBOX, sandbox_name),
    ] {
        if let Some(pod) = store
            .list_pods(namespace, &selector)
            .await?
            .into_iter()
            .next()
        {
            return Ok(pod);
        }
    }

    store
        .list_pods(namespace, &Selector::everything())
        .await?
        .into_iter()
        .find(|pod| {
            pod.meta
                .owner_references
                .iter()
                .any(|r| r.name == sandbox_name)
        })
        .ok_or_else(|| {
            ApiError::bad_gateway(format!("no pod found for sandbox {sandbox_name}"))
        })
}

/// Record tunnel activity locally and best-effort persist it onto the
/// object as a merge patch; a failed patch only delays the reaper.
async fn stamp_activity(app: &App, namespace: &str, name: &str, session_id: &str) {
    let now = chrono::Utc::now();
    app.index.touch_activity(session_id, now);

    let mut patch = BTreeMap::new();
    patch.insert(
        models::ANNOTATION_LAST_ACTIVITY.to_string(),
        now.to_rfc3339(),
    );
    if let Err(err) = app
        .factory
        .system_client()
        .patch_sandbox_annotations(namespace, name, patch)
        .await
    {
        tracing::warn!(%err, namespace, name, "failed to persist tunnel activity");
    }
}

async fn run_tunnel<S>(
    app: Arc<App>,
    client: S,
    backend: TcpStream,
    namespace: String,
    object_name: String,
    session_id: String,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = backend.into_split();

    // Each copier runs its direction to completion, then half-closes its
    // destination so the peer sees EOF while the reverse leg drains.
    let client_to_backend = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        copied
    };
    let backend_to_client = async {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };

    let copiers = async { tokio::join!(client_to_backend, backend_to_client) };

    let keep_alive = async {
        loop {
            tokio::time::sleep(ACTIVITY_INTERVAL).await;
            stamp_activity(&app, &namespace, &object_name, &session_id).await;
        }
    };

    // Joining both copiers is the close point; dropping the halves after
    // the join releases both sockets.
    tokio::select! {
        (up, down) = copiers => {
            match (up, down) {
                (Ok(up), Ok(down)) => tracing::info!(
                    session_id,
                    client_to_backend = up,
                    backend_to_client = down,
                    "tunnel closed",
                ),
                (up, down) => tracing::warn!(
                    session_id,
                    client_to_backend = ?up,
                    backend_to_client = ?down,
                    "tunnel closed with error",
                ),
            }
        }
        () = keep_alive => unreachable!("keep-alive loop never completes"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use object_store::{MemoryStore, ObjectMeta, OwnerKind, OwnerReference};

    fn pod(name: &str, labels: &[(&str, &str)], owner: Option<&str>) -> PodObject {
        PodObject {
            meta: ObjectMeta {
                name: name.to_string(),
                namespace: "ns".to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                owner_references: owner
                    .map(|sandbox| {
                        vec![OwnerReference {
                            kind: OwnerKind::Sandbox,
                            name: sandbox.to_string(),
                            uid: "uid-owner".to_string(),
                        }]
                    })
                    .unwrap_or_default(),
                ..Default::default()
            },
            phase: PodPhase::Running,
            pod_ip: Some("10.1.2.3".to_string()),
        }
    }

    #[tokio::test]
    async fn test_resolve_pod_by_exact_name() {
        let store = MemoryStore::new();
        store.put_pod(pod("sandbox-1", &[], None));
        let found = resolve_pod(store.as_ref(), "ns", "sandbox-1").await.unwrap();
        assert_eq!(found.meta.name, "sandbox-1");
    }

    #[tokio::test]
    async fn test_resolve_pod_by_labels_then_owner() {
        let store = MemoryStore::new();
        store.put_pod(pod(
            "pod-a",
            &[(models::LABEL_SANDBOX_NAME, "sandbox-1")],
            None,
        ));
        let found = resolve_pod(store.as_ref(), "ns", "sandbox-1").await.unwrap();
        assert_eq!(found.meta.name, "pod-a");

        let store = MemoryStore::new();
        store.put_pod(pod(
            "pod-b",
            &[(models::LABEL_NATIVE_SANDBOX, "sandbox-2")],
            None,
        ));
        let found = resolve_pod(store.as_ref(), "ns", "sandbox-2").await.unwrap();
        assert_eq!(found.meta.name, "pod-b");

        let store = MemoryStore::new();
        store.put_pod(pod("pod-c", &[], Some("sandbox-3")));
        let found = resolve_pod(store.as_ref(), "ns", "sandbox-3").await.unwrap();
        assert_eq!(found.meta.name, "pod-c");
    }

    #[tokio::test]
    async fn test_resolve_pod_missing_is_bad_gateway() {
        let store = MemoryStore::new();
        let err = resolve_pod(store.as_ref(), "ns", "nope").await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }
}
