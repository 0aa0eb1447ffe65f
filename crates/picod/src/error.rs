use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Errors surfaced by agent endpoints. Authentication failures are
/// terminal for the request, never for the process.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("request body exceeds the {} byte limit", crate::BODY_LIMIT)]
    PayloadTooLarge,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<crate::jail::PathEscape> for AgentError {
    fn from(err: crate::jail::PathEscape) -> Self {
        AgentError::BadRequest(err.to_string())
    }
}

impl From<crate::auth::AuthError> for AgentError {
    fn from(err: crate::auth::AuthError) -> Self {
        use crate::auth::AuthError;
        match err {
            AuthError::Unauthorized(reason) => AgentError::Unauthorized(reason),
            AuthError::AlreadyInitialized | AuthError::NotInitialized => {
                AgentError::Forbidden(err.to_string())
            }
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AgentError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AgentError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AgentError::Forbidden(_) => StatusCode::FORBIDDEN,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AgentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal causes are logged, not leaked.
        let message = match &self {
            AgentError::Internal(err) => {
                tracing::error!(error = format!("{err:#}"), "request failed internally");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        (status, axum::Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Json mirrors axum's extractor but maps malformed bodies to a 400
/// instead of axum's default rejection statuses.
pub struct Json<T>(pub T);

impl<T, S> axum::extract::FromRequest<S> for Json<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AgentError;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        match axum::extract::Json::<T>::from_request(req, state).await {
            Ok(axum::extract::Json(value)) => Ok(Json(value)),
            Err(rejection) => Err(AgentError::BadRequest(rejection.body_text())),
        }
    }
}
