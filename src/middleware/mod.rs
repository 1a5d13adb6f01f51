// Inbound authentication and CORS middleware

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tower_http::cors::{Any, CorsLayer};

use crate::error::{ApiError, OpenAiError};
use crate::routes::AppState;

/// Bearer-auth middleware for the /v1 surface.
///
/// The same shared secret is accepted from either an `x-api-key` header or
/// an `Authorization: Bearer …` header; x-api-key wins when both are sent.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, OpenAiError> {
    let expected = &state.config.bearer_token;

    if let Some(api_key) = request.headers().get("x-api-key") {
        if api_key.to_str().is_ok_and(|key| key == expected) {
            return Ok(next.run(request).await);
        }
        return Err(OpenAiError(ApiError::Auth("Invalid API key".to_string())));
    }

    let Some(auth_header) = request.headers().get("authorization") else {
        return Err(OpenAiError(ApiError::Auth(
            "Authorization header or x-api-key header required".to_string(),
        )));
    };

    let Ok(auth_str) = auth_header.to_str() else {
        return Err(OpenAiError(ApiError::Auth(
            "Invalid authorization format. Expected: Bearer <token>".to_string(),
        )));
    };

    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        return Err(OpenAiError(ApiError::Auth(
            "Invalid authorization format. Expected: Bearer <token>".to_string(),
        )));
    };

    if token.trim() != expected {
        return Err(OpenAiError(ApiError::Auth(
            "Invalid bearer token".to_string(),
        )));
    }

    Ok(next.run(request).await)
}

/// CORS layer allowing any origin, method, and header
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
