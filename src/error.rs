// Error handling module
// Defines error kinds and their per-dialect HTTP response shapes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while serving a request
#[derive(Error, Debug)]
pub enum ApiError {
    /// Client authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Request shape/range validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// No valid credential in the pool
    #[error("no valid access tokens available")]
    CredentialUnavailable,

    /// Non-200 from Amazon Q after all attempts
    #[error("upstream error: {status} - {message}")]
    Upstream { status: u16, message: String },

    /// Malformed event-stream frame or payload
    #[error("stream decode error: {0}")]
    Decode(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn log_if_internal(&self) {
        if let ApiError::Internal(err) = self {
            tracing::error!("Internal error: {:?}", err);
        }
    }
}

/// Wrapper rendering errors in the OpenAI `{"error": …}` shape
pub struct OpenAiError(pub ApiError);

impl From<ApiError> for OpenAiError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for OpenAiError {
    fn into_response(self) -> Response {
        self.0.log_if_internal();
        let (status, message) = match self.0 {
            ApiError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::CredentialUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to get bearer token".to_string(),
            ),
            ApiError::Upstream { status, message } => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                message,
            ),
            ApiError::Decode(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Wrapper rendering errors in the Anthropic typed error shape
pub struct AnthropicError(pub ApiError);

impl From<ApiError> for AnthropicError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AnthropicError {
    fn into_response(self) -> Response {
        self.0.log_if_internal();
        let (status, error_type, message) = match self.0 {
            ApiError::Auth(msg) => (StatusCode::UNAUTHORIZED, "authentication_error", msg),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg),
            ApiError::CredentialUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                "Failed to get bearer token".to_string(),
            ),
            ApiError::Upstream { status, message } => {
                if status == 400 {
                    (StatusCode::BAD_REQUEST, "invalid_request_error", message)
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "api_error", message)
                }
            }
            ApiError::Decode(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error", msg),
            ApiError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                err.to_string(),
            ),
        };

        let request_id = format!("req_{}", Uuid::new_v4());
        let body = Json(json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            },
            "request_id": request_id,
        }));

        let mut response = (status, body).into_response();
        if let Ok(value) = request_id.parse() {
            response.headers_mut().insert("request-id", value);
        }
        response
    }
}
