// End-to-end tests: a mock OIDC endpoint and a mock Amazon Q endpoint stand
// in for AWS; the gateway runs on an ephemeral port and is driven over HTTP.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::{BufMut, BytesMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use q2api::auth::{CredentialStore, StoreConfig};
use q2api::config::{AccountSource, Config};
use q2api::http_client::UpstreamClient;
use q2api::routes::{build_router, AppState};

const PROXY_KEY: &str = "test-proxy-key";

/// Wraps a JSON payload in event-stream framing (CRCs zeroed)
fn frame(payload: &serde_json::Value) -> Vec<u8> {
    let json_bytes = serde_json::to_vec(payload).unwrap();
    let total_len = 16 + json_bytes.len();

    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_u32(total_len as u32);
    buf.put_u32(0); // headers length
    buf.put_u32(0); // prelude CRC
    buf.put_slice(&json_bytes);
    buf.put_u32(0); // message CRC
    buf.to_vec()
}

fn event_stream_body(events: &[serde_json::Value]) -> Vec<u8> {
    let mut body = Vec::new();
    for event in events {
        body.extend(frame(event));
    }
    body
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

/// Stub OIDC endpoint: every exchange succeeds
async fn serve_oidc() -> String {
    let app = Router::new().route(
        "/token",
        post(|| async {
            Json(serde_json::json!({
                "accessToken": format!("at-{}", uuid::Uuid::new_v4()),
                "expiresIn": 3600,
                "refreshToken": "rt",
                "tokenType": "bearer"
            }))
        }),
    );
    serve(app).await
}

/// Stub Amazon Q endpoint replaying a fixed set of stream events
async fn serve_q(events: Vec<serde_json::Value>) -> String {
    let body = event_stream_body(&events);
    let app = Router::new().route(
        "/",
        post(move || {
            let body = body.clone();
            async move {
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/vnd.amazon.eventstream")
                    .body(Body::from(body))
                    .unwrap()
            }
        }),
    );
    serve(app).await
}

async fn write_accounts_csv(name: &str, rows: usize) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "q2api-it-{}-{}.csv",
        std::process::id(),
        name
    ));
    let mut data = String::from("enabled,refresh_token,client_id,client_secret\n");
    for i in 0..rows {
        data.push_str(&format!("True,rt-{},cid-{},sec-{}\n", i, i, i));
    }
    tokio::fs::write(&path, data).await.unwrap();
    path
}

async fn start_gateway(q_url: String, csv_path: PathBuf, oidc_url: String) -> String {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        bearer_token: PROXY_KEY.to_string(),
        amazon_q_url: q_url.clone(),
        proxy_url: None,
        account_source: AccountSource::Csv,
        accounts_csv_path: Some(csv_path.clone()),
        account_api_url: None,
        account_api_token: None,
        account_category_id: None,
        active_token_count: 2,
        max_refresh_attempt: 2,
        log_level: "info".to_string(),
    };

    let store_cfg = StoreConfig {
        source: AccountSource::Csv,
        csv_path: Some(csv_path),
        api_url: None,
        api_token: None,
        category_id: None,
        cache_path: std::env::temp_dir().join("q2api-it-cache.json"),
        active_token_count: config.active_token_count,
        max_refresh_attempts: config.max_refresh_attempt,
        oidc_url: format!("{}/token", oidc_url),
    };

    let store = CredentialStore::init(store_cfg, reqwest::Client::new())
        .await
        .unwrap();
    assert!(store.active_count().await > 0);

    let upstream = Arc::new(UpstreamClient::new(reqwest::Client::new(), store, q_url));
    let state = AppState {
        config: Arc::new(config),
        upstream,
    };

    serve(build_router(state)).await
}

#[tokio::test]
async fn test_openai_non_streaming_roundtrip() {
    let oidc = serve_oidc().await;
    let q = serve_q(vec![
        serde_json::json!({"conversation_id": "c1", "utterance_id": "u1"}),
        serde_json::json!({"content": "Hello "}),
        serde_json::json!({"content": "there"}),
    ])
    .await;
    let csv = write_accounts_csv("openai-agg", 2).await;
    let gateway = start_gateway(format!("{}/", q), csv, oidc).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway))
        .bearer_auth(PROXY_KEY)
        .json(&serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello there");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_openai_tool_call_fragments_aggregate() {
    let oidc = serve_oidc().await;
    let q = serve_q(vec![
        serde_json::json!({"toolUseId": "t1", "name": "f"}),
        serde_json::json!({"toolUseId": "t1", "input": "{\"x\":"}),
        serde_json::json!({"toolUseId": "t1", "input": "1}"}),
        serde_json::json!({"toolUseId": "t1", "stop": true}),
    ])
    .await;
    let csv = write_accounts_csv("openai-tools", 1).await;
    let gateway = start_gateway(format!("{}/", q), csv, oidc).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway))
        .bearer_auth(PROXY_KEY)
        .json(&serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "call the tool"}]
        }))
        .send()
        .await
        .unwrap();

    let body: serde_json::Value = response.json().await.unwrap();
    let tool_calls = &body["choices"][0]["message"]["tool_calls"];
    assert_eq!(tool_calls[0]["id"], "t1");
    assert_eq!(tool_calls[0]["index"], 0);
    assert_eq!(tool_calls[0]["function"]["name"], "f");
    assert_eq!(tool_calls[0]["function"]["arguments"], "{\"x\":1}");
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn test_openai_streaming_chunks() {
    let oidc = serve_oidc().await;
    let q = serve_q(vec![
        serde_json::json!({"content": "plain "}),
        serde_json::json!({"content": "<thinking>inner</thinking>after"}),
    ])
    .await;
    let csv = write_accounts_csv("openai-sse", 1).await;
    let gateway = start_gateway(format!("{}/", q), csv, oidc).await;

    let body = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway))
        .bearer_auth(PROXY_KEY)
        .json(&serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("\"role\":\"assistant\""));
    assert!(body.contains("\"content\":\"plain \""));
    assert!(body.contains("\"reasoning_content\":\"inner\""));
    assert!(body.contains("\"content\":\"after\""));
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn test_anthropic_streaming_block_sequence() {
    let oidc = serve_oidc().await;
    let q = serve_q(vec![
        serde_json::json!({"content": "hel<thi"}),
        serde_json::json!({"content": "nking>ok</thinking>bye"}),
    ])
    .await;
    let csv = write_accounts_csv("anthropic-sse", 1).await;
    let gateway = start_gateway(format!("{}/", q), csv, oidc).await;

    let body = reqwest::Client::new()
        .post(format!("{}/v1/messages", gateway))
        .header("x-api-key", PROXY_KEY)
        .json(&serde_json::json!({
            "model": "claude-sonnet-4",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let event_names: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .collect();
    assert_eq!(
        event_names,
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    assert!(body.contains("\"text\":\"hel\""));
    assert!(body.contains("\"thinking\":\"ok\""));
    assert!(body.contains("\"text\":\"bye\""));
    assert!(body.contains("\"stop_reason\":\"end_turn\""));
}

#[tokio::test]
async fn test_anthropic_non_streaming_blocks() {
    let oidc = serve_oidc().await;
    let q = serve_q(vec![
        serde_json::json!({"content": "<thinking>why</thinking>because"}),
        serde_json::json!({"toolUseId": "t9", "name": "probe", "input": "{\"a\":1}", "stop": true}),
    ])
    .await;
    let csv = write_accounts_csv("anthropic-agg", 1).await;
    let gateway = start_gateway(format!("{}/", q), csv, oidc).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/v1/messages", gateway))
        .header("x-api-key", PROXY_KEY)
        .json(&serde_json::json!({
            "model": "claude-sonnet-4",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "why?"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["type"], "message");
    assert_eq!(body["stop_reason"], "tool_use");
    let content = body["content"].as_array().unwrap();
    assert_eq!(content[0]["type"], "thinking");
    assert_eq!(content[0]["thinking"], "why");
    assert_eq!(content[1]["type"], "text");
    assert_eq!(content[1]["text"], "because");
    assert_eq!(content[2]["type"], "tool_use");
    assert_eq!(content[2]["input"]["a"], 1);
    assert!(body["usage"]["input_tokens"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_credential_eviction_recovers() {
    // Upstream fails twice with an eviction marker, then succeeds; the
    // client still gets a 200 and two credentials end up burned.
    let oidc = serve_oidc().await;

    let hits = Arc::new(AtomicU32::new(0));
    let hits_for_handler = Arc::clone(&hits);
    let ok_body = event_stream_body(&[serde_json::json!({"content": "recovered"})]);
    let app = Router::new().route(
        "/",
        post(move || {
            let hits = Arc::clone(&hits_for_handler);
            let ok_body = ok_body.clone();
            async move {
                if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                    (
                        StatusCode::BAD_REQUEST,
                        "{\"reason\":\"TEMPORARILY_SUSPENDED\"}",
                    )
                        .into_response()
                } else {
                    Response::builder()
                        .status(StatusCode::OK)
                        .header(header::CONTENT_TYPE, "application/vnd.amazon.eventstream")
                        .body(Body::from(ok_body))
                        .unwrap()
                }
            }
        }),
    );
    let q = serve(app).await;

    let csv = write_accounts_csv("eviction", 3).await;
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        bearer_token: PROXY_KEY.to_string(),
        amazon_q_url: format!("{}/", q),
        proxy_url: None,
        account_source: AccountSource::Csv,
        accounts_csv_path: Some(csv.clone()),
        account_api_url: None,
        account_api_token: None,
        account_category_id: None,
        active_token_count: 3,
        max_refresh_attempt: 2,
        log_level: "info".to_string(),
    };
    let store_cfg = StoreConfig {
        source: AccountSource::Csv,
        csv_path: Some(csv.clone()),
        api_url: None,
        api_token: None,
        category_id: None,
        cache_path: std::env::temp_dir().join("q2api-it-eviction-cache.json"),
        active_token_count: 3,
        max_refresh_attempts: 2,
        oidc_url: format!("{}/token", oidc),
    };
    let store = CredentialStore::init(store_cfg, reqwest::Client::new())
        .await
        .unwrap();
    assert_eq!(store.active_count().await, 3);

    let upstream = Arc::new(UpstreamClient::new(
        reqwest::Client::new(),
        Arc::clone(&store),
        format!("{}/", q),
    ));
    let state = AppState {
        config: Arc::new(config),
        upstream,
    };
    let gateway = serve(build_router(state)).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway))
        .bearer_auth(PROXY_KEY)
        .json(&serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "recovered");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(store.active_count().await, 1);

    // The disables were persisted to the CSV off the request path
    tokio::time::sleep(Duration::from_millis(300)).await;
    let data = tokio::fs::read_to_string(&csv).await.unwrap();
    assert_eq!(data.matches("False,").count(), 2);

    tokio::fs::remove_file(&csv).await.ok();
}

#[tokio::test]
async fn test_auth_rejection_and_validation() {
    let oidc = serve_oidc().await;
    let q = serve_q(vec![serde_json::json!({"content": "x"})]).await;
    let csv = write_accounts_csv("auth", 1).await;
    let gateway = start_gateway(format!("{}/", q), csv, oidc).await;
    let client = reqwest::Client::new();

    // Missing credentials
    let response = client
        .post(format!("{}/v1/chat/completions", gateway))
        .json(&serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Wrong key
    let response = client
        .post(format!("{}/v1/messages", gateway))
        .header("x-api-key", "wrong")
        .json(&serde_json::json!({"model": "m", "max_tokens": 1, "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Invalid request shapes come back 400 in the caller's error shape
    let response = client
        .post(format!("{}/v1/chat/completions", gateway))
        .bearer_auth(PROXY_KEY)
        .json(&serde_json::json!({"model": "m", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    let response = client
        .post(format!("{}/v1/messages", gateway))
        .header("x-api-key", PROXY_KEY)
        .json(&serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_count_tokens_endpoint() {
    let oidc = serve_oidc().await;
    let q = serve_q(vec![]).await;
    let csv = write_accounts_csv("count", 1).await;
    let gateway = start_gateway(format!("{}/", q), csv, oidc).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/v1/messages/count_tokens", gateway))
        .header("x-api-key", PROXY_KEY)
        .json(&serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "count these tokens please"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(body["input_tokens"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_web_search_without_query_rejected() {
    let oidc = serve_oidc().await;
    let q = serve_q(vec![]).await;
    let csv = write_accounts_csv("websearch", 1).await;
    let gateway = start_gateway(format!("{}/", q), csv, oidc).await;

    // A web_search request bypasses the Q endpoint entirely; with no
    // extractable query it fails fast in the caller's error shape.
    let response = reqwest::Client::new()
        .post(format!("{}/v1/messages", gateway))
        .header("x-api-key", PROXY_KEY)
        .json(&serde_json::json!({
            "model": "claude-sonnet-4",
            "max_tokens": 100,
            "tools": [{"name": "web_search", "description": "", "input_schema": {}}],
            "messages": [{"role": "user", "content": ""}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}
