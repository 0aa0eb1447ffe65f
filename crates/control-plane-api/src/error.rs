use axum::http::StatusCode;
use axum::response::IntoResponse;
use models::error_codes;

/// ApiError is the fundamental error type returned by the API: a status,
/// a short machine-readable code, and a message safe to show the caller.
/// Internal causes are logged, never leaked into the response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST, message)
    }

    pub fn invalid_ttl(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_TTL, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, error_codes::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, error_codes::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, error_codes::BAD_GATEWAY, message)
    }

    pub fn create_failed(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            error_codes::SANDBOX_CREATE_FAILED,
            message,
        )
    }

    pub fn sandbox_timeout(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::SANDBOX_TIMEOUT,
            message,
        )
    }

    pub fn client_creation_failed() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::CLIENT_CREATION_FAILED,
            "failed to build an object-store client for the caller",
        )
    }

    pub fn internal(error: anyhow::Error) -> Self {
        tracing::error!(error = format!("{error:#}"), "API responding with internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL,
            "internal error, please retry the request",
        )
    }
}

impl From<object_store::StoreError> for ApiError {
    fn from(error: object_store::StoreError) -> Self {
        use object_store::StoreError;
        match error {
            StoreError::NotFound { .. } => ApiError::not_found(error.to_string()),
            StoreError::AlreadyExists { .. } | StoreError::Conflict { .. } => {
                ApiError::create_failed(error.to_string())
            }
            StoreError::Unauthenticated => ApiError::unauthorized("token was rejected"),
            StoreError::Unavailable(reason) => {
                ApiError::bad_gateway(format!("object store unavailable: {reason}"))
            }
            StoreError::Internal(inner) => ApiError::internal(inner),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::internal(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = models::ErrorBody {
            error: self.code.to_string(),
            message: self.message,
            details: self.details,
            timestamp: chrono::Utc::now(),
            request_id: None,
        };
        (self.status, axum::Json(body)).into_response()
    }
}
