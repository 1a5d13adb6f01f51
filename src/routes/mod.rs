// HTTP surface
//
// /v1/chat/completions  OpenAI dialect, streaming or aggregated
// /v1/messages          Anthropic dialect (web_search requests divert to MCP)
// /v1/messages/count_tokens
// /v1/models            dialect-aware model list
//
// Bodies are read raw and parsed by hand so parse failures come back in the
// caller's error shape rather than the framework's.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::HeaderMap,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::converters::anthropic_to_q::map_anthropic_request;
use crate::converters::openai_to_q::map_openai_request;
use crate::error::{AnthropicError, ApiError, OpenAiError};
use crate::http_client::UpstreamClient;
use crate::mcp;
use crate::middleware;
use crate::models::anthropic::{
    self as anthropic_models, AnthropicRequest, AnthropicResponse, AnthropicUsage,
    TokenCountRequest, TokenCountResponse,
};
use crate::models::openai::{
    self as openai_models, ChatCompletionRequest, ChatCompletionResponse, Choice, ResponseMessage,
    Usage,
};
use crate::streaming::anthropic::{content_blocks, stop_reason, stream_anthropic_sse};
use crate::streaming::openai::{collect_response, stream_openai_sse};
use crate::tokenizer::{count_tokens, estimate_input_tokens};
use crate::validation::{validate_anthropic_request, validate_chat_completion_request};

/// Fixed `created` stamp on the OpenAI model list
const MODEL_CREATED: i64 = 1145141919;
const MODEL_CREATED_AT: &str = "2006-04-16T06:58:39Z";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: Arc<UpstreamClient>,
}

pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/messages", post(messages))
        .route("/messages/count_tokens", post(messages_count_tokens))
        .route("/models", get(list_models))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state);

    Router::new()
        .route("/", get(health))
        .nest("/v1", v1)
        .fallback(not_found)
        .layer(middleware::cors_layer())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found() -> Response {
    (
        axum::http::StatusCode::NOT_FOUND,
        Json(json!({"error": "not found"})),
    )
        .into_response()
}

fn sse_response(
    stream: impl futures::Stream<Item = Result<String, ApiError>> + Send + 'static,
) -> Result<Response, ApiError> {
    let byte_stream = stream.map(|item| {
        item.map(Bytes::from)
            .map_err(|e| std::io::Error::other(e.to_string()))
    });

    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(Body::from_stream(byte_stream))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))
}

// ==================================================================================================
// OpenAI Surface
// ==================================================================================================

async fn chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, OpenAiError> {
    let req: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    validate_chat_completion_request(&req).map_err(ApiError::Validation)?;

    tracing::info!(
        "chat/completions: model={}, stream={}, messages={}",
        req.model,
        req.stream,
        req.messages.len()
    );

    let conversation_id = Uuid::new_v4().to_string();
    let payload =
        map_openai_request(&req, &conversation_id).map_err(ApiError::Validation)?;

    let response = state.upstream.generate_assistant_response(&payload).await?;

    if req.stream {
        return Ok(sse_response(stream_openai_sse(response, req.model.clone()))?);
    }

    let collected = collect_response(response).await?;

    let finish_reason = if collected.tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };

    let completion = ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: req.model,
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: collected.content,
                tool_calls: collected.tool_calls,
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: Usage::default(),
    };

    Ok(Json(completion).into_response())
}

// ==================================================================================================
// Anthropic Surface
// ==================================================================================================

async fn messages(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AnthropicError> {
    let req: AnthropicRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?;
    validate_anthropic_request(&req).map_err(ApiError::Validation)?;

    tracing::info!(
        "messages: model={}, stream={}, messages={}, tools={}",
        req.model,
        req.stream,
        req.messages.len(),
        req.tools.len()
    );

    if mcp::has_web_search_tool(&req) {
        tracing::info!("web_search tool detected, routing to MCP endpoint");
        return mcp::handle_web_search(&state.upstream, &req).await;
    }

    let conversation_id = Uuid::new_v4().to_string();
    let payload =
        map_anthropic_request(&req, &conversation_id).map_err(ApiError::Validation)?;

    let response = state.upstream.generate_assistant_response(&payload).await?;

    let input_tokens = estimate_input_tokens(&req);

    if req.stream {
        return Ok(sse_response(stream_anthropic_sse(
            response,
            req.model.clone(),
            input_tokens,
        ))?);
    }

    let collected = collect_response(response).await?;

    let mut output_text = collected.content.clone();
    for tc in &collected.tool_calls {
        output_text.push_str(&tc.function.name);
        output_text.push_str(&tc.function.arguments);
    }

    let message = AnthropicResponse {
        id: format!("msg-{}", Uuid::new_v4()),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content: content_blocks(&collected.content, &collected.tool_calls),
        model: req.model,
        stop_reason: stop_reason(&collected.tool_calls).to_string(),
        usage: AnthropicUsage {
            input_tokens,
            output_tokens: count_tokens(&output_text),
        },
    };

    Ok(Json(message).into_response())
}

async fn messages_count_tokens(
    body: Bytes,
) -> Result<Json<TokenCountResponse>, AnthropicError> {
    let req: TokenCountRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?;

    let estimate_req = AnthropicRequest {
        model: req.model,
        messages: req.messages,
        max_tokens: 0,
        stream: false,
        system: req.system,
        tools: req.tools,
        temperature: None,
    };

    Ok(Json(TokenCountResponse {
        input_tokens: estimate_input_tokens(&estimate_req),
    }))
}

// ==================================================================================================
// Model Listing
// ==================================================================================================

async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, OpenAiError> {
    let q_models = state.upstream.list_models().await?;

    // Anthropic SDK clients authenticate with x-api-key; everything else
    // that is not a Bearer header is treated the same way.
    let api_key = headers.get("x-api-key").is_some();
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));

    if api_key || !bearer {
        let mut data = Vec::with_capacity(q_models.models.len() * 2);
        for model in &q_models.models {
            data.push(anthropic_models::Model {
                id: model.model_id.clone(),
                model_type: "model".to_string(),
                display_name: model.model_name.clone(),
                created_at: MODEL_CREATED_AT.to_string(),
            });
            data.push(anthropic_models::Model {
                id: format!("{}-thinking", model.model_id),
                model_type: "model".to_string(),
                display_name: format!("{} (Thinking)", model.model_name),
                created_at: MODEL_CREATED_AT.to_string(),
            });
        }
        let first_id = data.first().map(|m| m.id.clone()).unwrap_or_default();
        let last_id = data.last().map(|m| m.id.clone()).unwrap_or_default();
        return Ok(Json(anthropic_models::ModelsResponse {
            data,
            has_more: false,
            first_id,
            last_id,
        })
        .into_response());
    }

    let mut data = Vec::with_capacity(q_models.models.len() * 2);
    for model in &q_models.models {
        data.push(openai_models::Model {
            id: model.model_id.clone(),
            object: "model".to_string(),
            created: MODEL_CREATED,
            owned_by: "anthropic".to_string(),
        });
        data.push(openai_models::Model {
            id: format!("{}-thinking", model.model_id),
            object: "model".to_string(),
            created: MODEL_CREATED,
            owned_by: "anthropic".to_string(),
        });
    }

    Ok(Json(openai_models::ModelsResponse {
        object: "list".to_string(),
        data,
    })
    .into_response())
}
