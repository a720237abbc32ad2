use adsync_core::{ErrorKind, RunFailure, SyncError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Handler error rendered as `{"error": ..., "code": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A run that finished without producing data.
    #[error("{message}")]
    Run { kind: ErrorKind, message: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<RunFailure> for ApiError {
    fn from(failure: RunFailure) -> Self {
        ApiError::Run {
            kind: failure.kind,
            message: failure.message,
        }
    }
}

pub fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Config => StatusCode::BAD_REQUEST,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::AlreadyRunning => StatusCode::CONFLICT,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Transient => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Sync(err) => (status_for_kind(err.kind()), err.kind().as_str(), err.to_string()),
            ApiError::Run { kind, message } => (status_for_kind(*kind), kind.as_str(), message.clone()),
            ApiError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
        };
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }

        let body = json!({
            "error": message,
            "code": code,
        });
        (status, axum::Json(body)).into_response()
    }
}
