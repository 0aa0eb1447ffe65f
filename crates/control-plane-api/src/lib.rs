//! The REST façade over the session lifecycle: create, list, get, delete,
//! and the CONNECT tunnel into a sandbox pod. Every call is authorized
//! against the caller's principal; mutations go through a client built
//! from the caller's own bearer token.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use object_store::ClientFactory;

mod error;
mod handlers;
mod tunnel;

pub use error::ApiError;

/// Decides whether `principal` may act on a session owned by `creator`.
///
/// The default policy is principal equality with an implicit system
/// admin. Alternate policies (groups, labels) plug in here without
/// touching handlers.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, creator: &str, principal: &str) -> bool;
}

pub struct CreatorOrSystem {
    pub system_principal: String,
}

impl AccessPolicy for CreatorOrSystem {
    fn allows(&self, creator: &str, principal: &str) -> bool {
        principal == creator || principal == self.system_principal
    }
}

/// The caller's verified identity, attached by the authorization
/// middleware: the resolved principal plus the raw bearer token used to
/// build a per-user store client.
#[derive(Debug, Clone)]
pub struct Identity {
    pub principal: String,
    pub token: String,
}

pub struct Config {
    pub namespace: String,
    /// Warm pool to draw from on create, when installed.
    pub warm_pool: Option<String>,
    /// Port picod listens on inside each sandbox pod.
    pub in_pod_port: u16,
    pub connect_timeout: Duration,
    pub default_image: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            warm_pool: None,
            in_pod_port: 8888,
            connect_timeout: Duration::from_secs(10),
            default_image: "agentcube/sandbox:latest".to_string(),
        }
    }
}

pub struct App {
    pub index: Arc<control_plane::SessionIndex>,
    pub watch: Arc<control_plane::WatchAdapter>,
    pub factory: Arc<dyn object_store::ClientFactory>,
    pub clients: control_plane::UserClientCache,
    pub policy: Box<dyn AccessPolicy>,
    pub warm_poke: Option<tokio::sync::mpsc::Sender<()>>,
    pub config: Config,
}

impl App {
    /// Build (or reuse) the store client acting with the caller's authority.
    pub async fn user_client(
        &self,
        identity: &Identity,
    ) -> Result<Arc<dyn object_store::ObjectStore>, ApiError> {
        let key = (self.config.namespace.clone(), identity.principal.clone());
        if let Some(client) = self.clients.get(&key, &identity.token) {
            return Ok(client);
        }
        let client = self
            .factory
            .client_for_token(&identity.token)
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, principal = %identity.principal, "building user client failed");
                ApiError::client_creation_failed()
            })?;
        self.clients.set(key, &identity.token, client.clone());
        Ok(client)
    }
}

/// Request wraps a JSON-deserialized request type T which also implements
/// the validator::Validate trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct Request<T>(pub T);

impl<T, S> axum::extract::FromRequest<S> for Request<T>
where
    T: serde::de::DeserializeOwned + validator::Validate,
    S: Send + Sync,
    axum::extract::Json<T>:
        axum::extract::FromRequest<S, Rejection = axum::extract::rejection::JsonRejection>,
{
    type Rejection = ApiError;

    async fn from_request(req: axum::extract::Request, state: &S) -> Result<Self, Self::Rejection> {
        let axum::extract::Json(value) = axum::extract::Json::<T>::from_request(req, state)
            .await
            .map_err(|err| ApiError::bad_request(err.body_text()))?;
        value
            .validate()
            .map_err(|err| ApiError::bad_request(format!("{err}").replace('\n', ", ")))?;
        Ok(Request(value))
    }
}

/// Build the control plane's API router.
pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    use axum::routing::{any, get, post};

    let authorized = axum::Router::new()
        .route(
            "/v1/sandboxes",
            post(handlers::create_sandbox).get(handlers::list_sandboxes),
        )
        .route("/v1/sandboxes/{id}", any(handlers::sandbox_by_id))
        .route_layer(axum::middleware::from_fn_with_state(app.clone(), authorize));

    axum::Router::new()
        .route("/health", get(handlers::health))
        .merge(authorized)
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .on_failure(tower_http::trace::DefaultOnFailure::new().level(tracing::Level::INFO)),
        )
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_methods(tower_http::cors::AllowMethods::mirror_request())
                .allow_origin(tower_http::cors::AllowOrigin::any())
                .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION]),
        )
        .with_state(app)
}

/// Middleware which verifies the bearer token before proceeding, and then
/// attaches the caller's Identity.
async fn authorize(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    axum_extra::TypedHeader(bearer): axum_extra::TypedHeader<
        axum_extra::headers::Authorization<axum_extra::headers::authorization::Bearer>,
    >,
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let token = bearer.token();

    let principal = match app.factory.authenticate(token).await {
        Ok(principal) => principal,
        Err(err) => {
            return ApiError::unauthorized(format!("failed to resolve bearer token: {err}"))
                .into_response();
        }
    };

    req.extensions_mut().insert(Identity {
        principal,
        token: token.to_string(),
    });
    next.run(req).await
}

/// Serve until `shutdown` is cancelled, then drain with a bounded grace.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: axum::Router<()>,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    use std::future::IntoFuture;

    const GRACE: Duration = Duration::from_secs(10);

    let drain = shutdown.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { drain.cancelled().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => Ok(result?),
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(GRACE).await;
        } => {
            tracing::warn!("shutdown grace period elapsed with connections still open");
            Ok(())
        }
    }
}

pub(crate) fn method_not_allowed() -> axum::response::Response {
    (StatusCode::METHOD_NOT_ALLOWED, "").into_response()
}
