// MCP web-search adapter
//
// Requests declaring a `web_search` tool never reach the conversation
// endpoint. The query goes to the hosted MCP web_search tool over JSON-RPC
// and the reply is synthesised into an Anthropic SSE transcript: a
// server_tool_use block, a web_search_tool_result block, and a readable
// text summary.

use axum::{body::Body, response::Response};
use chrono::Utc;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AnthropicError, ApiError};
use crate::http_client::UpstreamClient;
use crate::models::anthropic::AnthropicRequest;
use crate::streaming::anthropic::format_sse_event;
use crate::tokenizer::{count_tokens, estimate_input_tokens};

const MCP_URL: &str = "https://q.us-east-1.amazonaws.com/mcp";
const QUERY_PREFIX: &str = "Perform a web search for the query: ";
const DEFAULT_MAX_USES: usize = 5;

// ==================================================================================================
// JSON-RPC Shapes
// ==================================================================================================

#[derive(Debug, Serialize)]
struct McpRequest {
    id: String,
    jsonrpc: String,
    method: String,
    params: McpParams,
}

#[derive(Debug, Serialize)]
struct McpParams {
    name: String,
    arguments: McpArguments,
}

#[derive(Debug, Serialize)]
struct McpArguments {
    query: String,
}

#[derive(Debug, Deserialize)]
struct McpResponse {
    #[serde(default)]
    result: Option<McpResult>,
    #[serde(default)]
    error: Option<McpError>,
}

#[derive(Debug, Deserialize)]
struct McpResult {
    #[serde(default)]
    content: Vec<McpContent>,
}

#[derive(Debug, Deserialize)]
struct McpContent {
    #[serde(rename = "type", default)]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct McpError {
    code: i64,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebSearchResults {
    #[serde(default)]
    pub results: Vec<WebSearchResult>,
    #[serde(default, rename = "totalResults")]
    pub total_results: i64,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct WebSearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

// ==================================================================================================
// Request Handling
// ==================================================================================================

pub fn has_web_search_tool(req: &AnthropicRequest) -> bool {
    req.tools.iter().any(|tool| tool.name == "web_search")
}

/// Pulls the search query out of the first user message, stripping the
/// standard instruction prefix when present
pub fn extract_search_query(req: &AnthropicRequest) -> String {
    let Some(first) = req.messages.first() else {
        return String::new();
    };
    let text = first.content.first_text();
    match text.strip_prefix(QUERY_PREFIX) {
        Some(rest) => rest.trim().to_string(),
        None => text.to_string(),
    }
}

fn max_uses(req: &AnthropicRequest) -> usize {
    req.tools
        .iter()
        .find(|tool| tool.name == "web_search" && tool.max_uses > 0)
        .map(|tool| tool.max_uses as usize)
        .unwrap_or(DEFAULT_MAX_USES)
}

fn mcp_request_id() -> String {
    format!(
        "web_search_tooluse_{}_{}_{}",
        &Uuid::new_v4().to_string()[..22],
        Utc::now().timestamp_millis(),
        &Uuid::new_v4().to_string()[..8]
    )
}

/// Serves a web_search request end to end.
///
/// The reply is always an SSE transcript, mirroring the original behaviour
/// even for clients that did not set `stream`.
pub async fn handle_web_search(
    upstream: &UpstreamClient,
    req: &AnthropicRequest,
) -> Result<Response, AnthropicError> {
    let input_tokens = estimate_input_tokens(req);

    let query = extract_search_query(req);
    if query.is_empty() {
        return Err(AnthropicError(ApiError::Validation(
            "Cannot extract search query".to_string(),
        )));
    }

    let bearer = upstream.store().acquire().await.map_err(AnthropicError)?;

    let rpc = McpRequest {
        id: mcp_request_id(),
        jsonrpc: "2.0".to_string(),
        method: "tools/call".to_string(),
        params: McpParams {
            name: "web_search".to_string(),
            arguments: McpArguments {
                query: query.clone(),
            },
        },
    };

    let response = upstream
        .client()
        .post(MCP_URL)
        .header("Content-Type", "application/json")
        .bearer_auth(&bearer)
        .json(&rpc)
        .send()
        .await
        .map_err(|e| {
            tracing::error!("MCP request failed: {}", e);
            AnthropicError(ApiError::Upstream {
                status: 502,
                message: "MCP service unavailable".to_string(),
            })
        })?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let parsed: Option<McpResponse> = serde_json::from_str(&body).ok();

    let rpc_response = match parsed {
        Some(rpc_response) if status.is_success() && rpc_response.error.is_none() => rpc_response,
        _ => {
            tracing::error!("MCP request failed: status={}, body={}", status, body);
            return Err(AnthropicError(ApiError::Upstream {
                status: 502,
                message: "MCP request failed".to_string(),
            }));
        }
    };

    // The result's text elements carry the search payload as embedded JSON.
    let results = rpc_response.result.and_then(|result| {
        result
            .content
            .iter()
            .filter(|content| content.content_type == "text")
            .find_map(|content| serde_json::from_str::<WebSearchResults>(&content.text).ok())
    });

    if let Some(found) = &results {
        tracing::debug!(
            "web_search '{}' returned {} result(s) (total {})",
            found.query,
            found.results.len(),
            found.total_results
        );
    }

    let events = synthesize_events(
        &req.model,
        &query,
        results.as_ref(),
        max_uses(req),
        input_tokens,
    );

    let body = Body::from_stream(stream::iter(
        events
            .into_iter()
            .map(Ok::<_, std::convert::Infallible>),
    ));

    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(body)
        .map_err(|e| AnthropicError(ApiError::Internal(anyhow::anyhow!(e))))
}

// ==================================================================================================
// Transcript Synthesis
// ==================================================================================================

/// Builds the full SSE transcript around a search result
pub fn synthesize_events(
    model: &str,
    query: &str,
    results: Option<&WebSearchResults>,
    max_uses: usize,
    input_tokens: i32,
) -> Vec<String> {
    let tool_use_id = format!("srvtoolu_{}", Uuid::new_v4().simple());
    let message_id = format!("msg_{}", &Uuid::new_v4().simple().to_string()[..24]);

    let mut events = Vec::with_capacity(12);

    events.push(format_sse_event(
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": input_tokens, "output_tokens": 0},
            },
        }),
    ));

    events.push(format_sse_event(
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {
                "id": tool_use_id,
                "type": "server_tool_use",
                "name": "web_search",
                "input": {},
            },
        }),
    ));
    events.push(format_sse_event(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {
                "type": "input_json_delta",
                "partial_json": json!({"query": query}).to_string(),
            },
        }),
    ));
    events.push(format_sse_event(
        "content_block_stop",
        &json!({"type": "content_block_stop", "index": 0}),
    ));

    let shown: &[WebSearchResult] = match results {
        Some(results) => {
            let limit = results.results.len().min(max_uses.max(1));
            &results.results[..limit]
        }
        None => &[],
    };

    let search_content: Vec<Value> = shown
        .iter()
        .map(|result| {
            json!({
                "type": "web_search_result",
                "title": result.title,
                "url": result.url,
                "encrypted_content": result.snippet,
                "page_age": null,
            })
        })
        .collect();

    events.push(format_sse_event(
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": {
                "type": "web_search_tool_result",
                "tool_use_id": tool_use_id,
                "content": search_content,
            },
        }),
    ));
    events.push(format_sse_event(
        "content_block_stop",
        &json!({"type": "content_block_stop", "index": 1}),
    ));

    let summary = build_summary(query, shown);

    events.push(format_sse_event(
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": 2,
            "content_block": {"type": "text", "text": ""},
        }),
    ));
    events.push(format_sse_event(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": 2,
            "delta": {"type": "text_delta", "text": summary},
        }),
    ));
    events.push(format_sse_event(
        "content_block_stop",
        &json!({"type": "content_block_stop", "index": 2}),
    ));

    events.push(format_sse_event(
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": {"stop_reason": "end_turn", "stop_sequence": null},
            "usage": {"output_tokens": count_tokens(&summary)},
        }),
    ));
    events.push(format_sse_event(
        "message_stop",
        &json!({"type": "message_stop"}),
    ));

    events
}

fn build_summary(query: &str, results: &[WebSearchResult]) -> String {
    let mut summary = format!("Here are the search results for \"{}\":\n\n", query);

    if results.is_empty() {
        summary.push_str("No results found.\n");
        return summary;
    }

    for (i, result) in results.iter().enumerate() {
        summary.push_str(&format!("{}. **{}**\n", i + 1, result.title));
        if !result.snippet.is_empty() {
            let snippet = truncate_chars(&result.snippet, 200);
            if snippet.len() < result.snippet.len() {
                summary.push_str(&format!("   {}...\n", snippet));
            } else {
                summary.push_str(&format!("   {}\n", snippet));
            }
        }
        summary.push_str(&format!("   Source: {}\n\n", result.url));
    }

    summary
}

fn truncate_chars(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: serde_json::Value) -> AnthropicRequest {
        serde_json::from_value(body).unwrap()
    }

    fn search_request(first_message: &str) -> AnthropicRequest {
        request(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 100,
            "tools": [{"name": "web_search", "description": "", "input_schema": {}}],
            "messages": [{"role": "user", "content": first_message}]
        }))
    }

    fn results(n: usize) -> WebSearchResults {
        WebSearchResults {
            results: (0..n)
                .map(|i| WebSearchResult {
                    title: format!("Result {}", i),
                    url: format!("https://example.com/{}", i),
                    snippet: format!("snippet {}", i),
                })
                .collect(),
            total_results: n as i64,
            query: "q".to_string(),
        }
    }

    #[test]
    fn test_has_web_search_tool() {
        assert!(has_web_search_tool(&search_request("x")));

        let other = request(json!({
            "model": "m",
            "max_tokens": 1,
            "tools": [{"name": "calculator", "description": "", "input_schema": {}}],
            "messages": [{"role": "user", "content": "x"}]
        }));
        assert!(!has_web_search_tool(&other));
    }

    #[test]
    fn test_extract_query_strips_prefix() {
        let req = search_request("Perform a web search for the query: rust async traits");
        assert_eq!(extract_search_query(&req), "rust async traits");
    }

    #[test]
    fn test_extract_query_without_prefix() {
        let req = search_request("plain question");
        assert_eq!(extract_search_query(&req), "plain question");
    }

    #[test]
    fn test_mcp_request_id_pattern() {
        let id = mcp_request_id();
        assert!(id.starts_with("web_search_tooluse_"));
        let rest = &id["web_search_tooluse_".len()..];
        let segments: Vec<&str> = rest.split('_').collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len(), 22);
        assert!(segments[1].parse::<i64>().is_ok());
        assert_eq!(segments[2].len(), 8);
    }

    #[test]
    fn test_synthesized_transcript_structure() {
        let results = results(2);
        let events = synthesize_events("claude-sonnet-4", "rust", Some(&results), 5, 12);

        let names: Vec<&str> = events
            .iter()
            .map(|e| {
                e.lines()
                    .next()
                    .unwrap()
                    .strip_prefix("event: ")
                    .unwrap()
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        // The server_tool_use block carries the query as partial json
        assert!(events[2].contains("input_json_delta"));
        assert!(events[2].contains("rust"));
        // The result block lists both hits
        assert!(events[4].contains("web_search_tool_result"));
        assert!(events[4].contains("https://example.com/0"));
        assert!(events[4].contains("https://example.com/1"));
        // The final summary names the top result
        assert!(events[7].contains("Result 0"));
        assert!(events[9].contains("end_turn"));
    }

    #[test]
    fn test_max_uses_caps_results() {
        let results = results(8);
        let events = synthesize_events("m", "q", Some(&results), 3, 0);
        let result_block = &events[4];
        assert!(result_block.contains("https://example.com/2"));
        assert!(!result_block.contains("https://example.com/3"));
    }

    #[test]
    fn test_no_results_summary() {
        let events = synthesize_events("m", "q", None, 5, 0);
        assert!(events[7].contains("No results found."));
    }

    #[test]
    fn test_summary_truncates_long_snippets() {
        let long = WebSearchResults {
            results: vec![WebSearchResult {
                title: "T".to_string(),
                url: "https://example.com".to_string(),
                snippet: "s".repeat(300),
            }],
            total_results: 1,
            query: "q".to_string(),
        };
        let summary = build_summary("q", &long.results);
        assert!(summary.contains(&format!("{}...", "s".repeat(200))));
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        let text = "héllo wörld".repeat(30);
        let cut = truncate_chars(&text, 200);
        assert!(cut.len() <= 200);
        assert!(text.starts_with(cut));
    }
}
