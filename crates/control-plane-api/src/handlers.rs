use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use control_plane::index::parse_record;
use models::{
    CreateSandboxRequest, ListQuery, MessageResponse, SandboxListResponse, SessionRecord,
};
use object_store::{ClientFactory, ObjectMeta, ObjectStore, PodTemplate, SandboxObject};

use crate::{ApiError, App, Identity, Request};

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

#[tracing::instrument(skip_all, fields(principal = %identity.principal))]
pub async fn create_sandbox(
    State(app): State<Arc<App>>,
    Extension(identity): Extension<Identity>,
    Request(body): Request<CreateSandboxRequest>,
) -> Result<Json<SessionRecord>, ApiError> {
    let ttl = match body.ttl {
        Some(ttl) => models::validate_ttl(ttl).map_err(|err| ApiError::invalid_ttl(err.to_string()))?,
        None => models::TTL_DEFAULT_SECS,
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let object_name = models::object_name_for_session(&session_id);
    let namespace = app.config.namespace.clone();

    // Register the single-shot Ready watcher before anything can create
    // the object, so a fast Ready transition cannot be missed.
    let ready = app.watch.watch_ready(&object_name);

    // A Ready warm sandbox short-circuits the create path entirely. The
    // hand-off rewrites pool-owned objects, which is the system's job.
    if let Some(pool) = &app.config.warm_pool {
        let claimed = control_plane::warm_pool::claim_warm(
            app.factory.system_client().as_ref(),
            &namespace,
            pool,
            &session_id,
            &identity.principal,
            ttl,
            &body.metadata,
        )
        .await?;

        if let Some(bound) = claimed {
            app.watch.cancel_watch(&object_name);
            if let Some(poke) = &app.warm_poke {
                let _ = poke.try_send(());
            }
            let record = parse_record(&bound)
                .ok_or_else(|| ApiError::internal(anyhow::anyhow!("claimed sandbox has no session id")))?;
            app.index.set(record.clone());
            tracing::info!(session_id = %record.session_id, sandbox = %bound.meta.name, "bound warm sandbox");
            return Ok(Json(record));
        }
    }

    let client = app.user_client(&identity).await?;
    let now = chrono::Utc::now().to_rfc3339();

    let mut labels = BTreeMap::new();
    labels.insert(models::LABEL_SESSION_ID.to_string(), session_id.clone());
    labels.insert(models::LABEL_MANAGED_BY.to_string(), models::MANAGED_BY.to_string());

    let mut annotations: BTreeMap<String, String> = body.metadata.clone();
    annotations.insert(models::ANNOTATION_TTL.to_string(), ttl.to_string());
    annotations.insert(
        models::ANNOTATION_CREATOR.to_string(),
        identity.principal.clone(),
    );
    annotations.insert(models::ANNOTATION_LAST_ACTIVITY.to_string(), now.clone());
    annotations.insert(control_plane::ANNOTATION_SESSION_CREATED.to_string(), now);

    let sandbox = SandboxObject {
        meta: ObjectMeta {
            name: object_name.clone(),
            namespace: namespace.clone(),
            labels,
            annotations,
            ..Default::default()
        },
        template: PodTemplate {
            image: body
                .image
                .unwrap_or_else(|| app.config.default_image.clone()),
            ssh_public_key: body.ssh_public_key,
            ..Default::default()
        },
        ready: None,
    };

    if let Err(err) = client.create_sandbox(sandbox).await {
        app.watch.cancel_watch(&object_name);
        tracing::warn!(error = %err, %object_name, "sandbox create failed");
        return Err(ApiError::create_failed(format!(
            "creating sandbox failed: {err}"
        )));
    }

    // Suspend until the watch observes Ready, bounded by the session TTL.
    match tokio::time::timeout(Duration::from_secs(ttl), ready).await {
        Ok(Ok(record)) => {
            app.index.set(record.clone());
            tracing::info!(session_id = %record.session_id, sandbox = %object_name, "sandbox ready");
            Ok(Json(record))
        }
        Ok(Err(_closed)) => {
            app.watch.cancel_watch(&object_name);
            Err(ApiError::internal(anyhow::anyhow!(
                "ready watcher closed before the sandbox became ready"
            )))
        }
        Err(_elapsed) => {
            app.watch.cancel_watch(&object_name);
            Err(ApiError::sandbox_timeout(format!(
                "sandbox {object_name} did not become ready within {ttl}s"
            )))
        }
    }
}

pub async fn list_sandboxes(
    State(app): State<Arc<App>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListQuery>,
) -> Result<Json<SandboxListResponse>, ApiError> {
    let (limit, offset) = query.resolve().map_err(ApiError::bad_request)?;

    let mine: Vec<SessionRecord> = app
        .index
        .list()
        .into_iter()
        .filter(|r| r.creator_principal == identity.principal)
        .collect();

    let total = mine.len();
    let sandboxes = mine.into_iter().skip(offset).take(limit).collect();

    Ok(Json(SandboxListResponse {
        sandboxes,
        total,
        limit,
        offset,
    }))
}

/// `/v1/sandboxes/{id}` serves GET, DELETE, and CONNECT from one route so
/// the tunnel can share the path with the record operations.
pub async fn sandbox_by_id(
    State(app): State<Arc<App>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    req: axum::extract::Request,
) -> axum::response::Response {
    let method = req.method().clone();
    if method == Method::GET {
        get_sandbox(app, identity, id).await.into_response()
    } else if method == Method::DELETE {
        delete_sandbox(app, identity, id).await.into_response()
    } else if method == Method::CONNECT {
        crate::tunnel::tunnel(app, identity, id, req).await.into_response()
    } else {
        crate::method_not_allowed()
    }
}

/// Fetch the caller-visible record for `id`, enforcing ownership.
fn authorized_record(app: &App, identity: &Identity, id: &str) -> Result<SessionRecord, ApiError> {
    let record = app
        .index
        .get(id)
        .ok_or_else(|| ApiError::not_found(format!("sandbox {id} not found")))?;
    if !app.policy.allows(&record.creator_principal, &identity.principal) {
        return Err(ApiError::forbidden("caller does not own this sandbox"));
    }
    Ok(record)
}

async fn get_sandbox(
    app: Arc<App>,
    identity: Identity,
    id: String,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(authorized_record(&app, &identity, &id)?))
}

async fn delete_sandbox(
    app: Arc<App>,
    identity: Identity,
    id: String,
) -> Result<Json<MessageResponse>, ApiError> {
    let record = authorized_record(&app, &identity, &id)?;

    // Delete with the caller's own authority. The index is left alone:
    // the watch is the single writer on delete paths, and removes the
    // record when the deletion is observed.
    let client = app.user_client(&identity).await?;
    match client.delete_sandbox(&record.namespace, &record.object_name).await {
        Ok(()) => (),
        Err(err) if err.is_not_found() => (),
        Err(err) => return Err(err.into()),
    }

    tracing::info!(session_id = %id, sandbox = %record.object_name, "sandbox deletion requested");
    Ok(Json(MessageResponse {
        message: format!("sandbox {id} deleted"),
    }))
}
