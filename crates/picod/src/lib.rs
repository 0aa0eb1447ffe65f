//! picod is the sandbox-local agent: a small HTTP server that accepts
//! signed requests from the control plane or end user and performs
//! command execution, file I/O, and optionally stateful code execution.
//! The process is an independent trust domain, sealed to a single session
//! key on first `/init`.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

pub mod auth;
pub mod canonical;
pub mod error;
pub mod evaluator;
pub mod execute;
pub mod files;
pub mod jail;

use auth::AuthManager;
use error::AgentError;
use evaluator::Evaluator;
use jail::PathJail;

/// Hard cap applied to request bodies once verified.
pub const BODY_LIMIT: usize = 32 << 20;

#[derive(clap::Parser, Debug)]
#[clap(about = "AgentCube in-sandbox agent.")]
pub struct Args {
    /// Address to listen on.
    #[clap(long, env = "PICOD_ADDRESS", default_value = "0.0.0.0:8888")]
    pub address: String,

    /// Workspace root that confines all file operations.
    #[clap(long, env = "PICOD_WORKSPACE", default_value = "/workspace")]
    pub workspace: String,

    /// Path to the bootstrap public key PEM.
    #[clap(long, env = "PICOD_BOOTSTRAP_KEY")]
    pub bootstrap_key: String,

    /// Where the promoted session key is persisted. Its presence at boot
    /// puts the agent directly into the sealed state.
    #[clap(long, env = "PICOD_KEY_FILE", default_value = "./picod_public_key.pem")]
    pub key_file: String,

    /// Evaluator kernel argv. When absent, /api/run_code is not served.
    #[clap(long = "kernel", env = "PICOD_KERNEL", num_args = 1.., value_delimiter = ' ')]
    pub kernel: Vec<String>,
}

pub struct AppState {
    pub auth: AuthManager,
    pub jail: PathJail,
    pub evaluator: Option<Arc<dyn Evaluator>>,
    pub started_at: std::time::Instant,
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let bootstrap_pem = tokio::fs::read(&args.bootstrap_key)
        .await
        .with_context(|| format!("reading bootstrap key {:?}", args.bootstrap_key))?;
    let auth = AuthManager::new(&bootstrap_pem, args.key_file.clone().into())
        .context("loading agent auth state")?;

    tokio::fs::create_dir_all(&args.workspace)
        .await
        .with_context(|| format!("creating workspace {:?}", args.workspace))?;
    let jail = PathJail::new(&args.workspace).context("resolving workspace root")?;

    // Kernel start failure is fatal: an agent advertised as supporting
    // run_code must not come up without it.
    let evaluator = if args.kernel.is_empty() {
        None
    } else {
        Some(Arc::new(evaluator::KernelEvaluator::start(&args.kernel)?) as Arc<dyn Evaluator>)
    };

    let state = Arc::new(AppState {
        auth,
        jail,
        evaluator,
        started_at: std::time::Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind(&args.address)
        .await
        .with_context(|| format!("binding {}", args.address))?;
    tracing::info!(
        address = %args.address,
        workspace = %args.workspace,
        sealed = state.auth.initialized(),
        "picod started",
    );

    // Gracefully exit on either SIGINT (ctrl-c) or SIGTERM.
    let signal = async {
        use tokio::signal::unix;
        let mut sigint = unix::signal(unix::SignalKind::interrupt()).unwrap();
        let mut sigterm = unix::signal(unix::SignalKind::terminate()).unwrap();
        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
        tracing::info!("caught signal to exit");
    };

    axum::serve(listener, build_router(state.clone()))
        .with_graceful_shutdown(signal)
        .await?;

    // The evaluator drains its in-flight call before terminating.
    if let Some(evaluator) = &state.evaluator {
        evaluator.shutdown().await;
    }
    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> axum::Router<()> {
    use axum::routing::{get, post};

    let api = axum::Router::new()
        .route("/api/execute", post(execute_handler))
        .route("/api/files", post(files::upload).get(files::list))
        .route("/api/files/{*path}", get(files::download))
        .route("/api/run_code", post(run_code))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            session_auth,
        ));

    axum::Router::new()
        .route("/health", get(health))
        .route("/init", post(init))
        .merge(api)
        .layer(axum::extract::DefaultBodyLimit::max(BODY_LIMIT))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Extract the bearer token from an Authorization header.
fn bearer_token(headers: &axum::http::HeaderMap) -> Result<&str, AgentError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")))
        .ok_or_else(|| AgentError::Unauthorized("missing bearer token".into()))
}

/// Session-auth middleware for `/api/*`.
///
/// Non-multipart bodies are buffered (capped) so the canonical request
/// hash can be recomputed and compared against the token's binding claim.
/// Multipart uploads stream through unhashed: clients cannot practically
/// hash a streaming upload, so the binding claim is not required there.
async fn session_auth(
    State(state): State<Arc<AppState>>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    match verify_call(&state, req).await {
        Ok(req) => next.run(req).await,
        Err(err) => err.into_response(),
    }
}

async fn verify_call(
    state: &AppState,
    req: axum::extract::Request,
) -> Result<axum::extract::Request, AgentError> {
    let (parts, body) = req.into_parts();

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let is_multipart = content_type
        .as_deref()
        .map(|value| {
            value
                .trim()
                .to_ascii_lowercase()
                .starts_with("multipart/form-data")
        })
        .unwrap_or(false);

    if is_multipart {
        let canonical = canonical::canonical_request_sha256(
            parts.method.as_str(),
            parts.uri.path(),
            parts.uri.query(),
            content_type.as_deref(),
            b"",
        );
        let token = bearer_token(&parts.headers)?;
        state.auth.authorize_call(token, &canonical, false)?;
        Ok(axum::extract::Request::from_parts(parts, body))
    } else {
        let bytes = axum::body::to_bytes(body, BODY_LIMIT)
            .await
            .map_err(|_| AgentError::PayloadTooLarge)?;
        let canonical = canonical::canonical_request_sha256(
            parts.method.as_str(),
            parts.uri.path(),
            parts.uri.query(),
            content_type.as_deref(),
            &bytes,
        );
        let token = bearer_token(&parts.headers)?;
        state
            .auth
            .authorize_call(token, &canonical, !bytes.is_empty())?;
        Ok(axum::extract::Request::from_parts(
            parts,
            axum::body::Body::from(bytes),
        ))
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = std::time::Duration::from_secs(state.started_at.elapsed().as_secs());
    axum::Json(serde_json::json!({
        "status": "ok",
        "service": "picod",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": humantime::format_duration(uptime).to_string(),
    }))
}

/// `POST /init`: promote the session key carried by a bootstrap-signed
/// token and seal the process. Forbidden once sealed.
async fn init(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Result<axum::Json<serde_json::Value>, AgentError> {
    let token = bearer_token(&headers)?;
    state.auth.authorize_init(token)?;
    Ok(axum::Json(serde_json::json!({"message": "initialized"})))
}

async fn execute_handler(
    State(state): State<Arc<AppState>>,
    error::Json(request): error::Json<execute::ExecuteRequest>,
) -> Result<axum::Json<execute::ExecuteResponse>, AgentError> {
    let response = execute::run_command(&state.jail, request).await?;
    Ok(axum::Json(response))
}

#[derive(Debug, serde::Deserialize)]
struct RunCodeRequest {
    code: String,
}

async fn run_code(
    State(state): State<Arc<AppState>>,
    error::Json(request): error::Json<RunCodeRequest>,
) -> Result<axum::Json<evaluator::ExecutionResult>, AgentError> {
    let evaluator = state
        .evaluator
        .as_ref()
        .ok_or_else(|| AgentError::NotFound("code execution is not enabled".into()))?;
    let result = evaluator
        .execute_code(&request.code)
        .await
        .context("executing code")?;
    Ok(axum::Json(result))
}
