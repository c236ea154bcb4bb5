use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use allot_core::CoreError;

// ==============================================================================
// Error Type
// ==============================================================================

#[derive(Debug)]
pub(crate) enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err {
            CoreError::InputValidation(_) => Self::BadRequest(message),
            CoreError::Unauthorized(_) => Self::Forbidden(message),
            CoreError::NotFound { .. } => Self::NotFound(message),
            CoreError::NothingToCancel(_) | CoreError::ExecutionConflict(_) => {
                Self::Conflict(message)
            }
            CoreError::InsufficientFunds { .. } => Self::Unprocessable(message),
            CoreError::BroadcastFailure(_) | CoreError::Rpc(_) => Self::BadGateway(message),
            CoreError::SigningFailure { .. } | CoreError::Internal(_) | CoreError::Io(_) => {
                Self::Internal(message)
            }
        }
    }
}
