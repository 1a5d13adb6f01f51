// Outbound HTTP
//
// One proxy-aware client factory plus the Amazon Q upstream client. The
// upstream gates on the exact request surface of the official CLI, so the
// header set below is reproduced verbatim and connections stay on HTTP/1.1.

use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::CredentialStore;
use crate::error::ApiError;
use crate::models::q::{QApiRequest, QModelsResponse};

const USER_AGENT: &str = "aws-sdk-rust/1.3.10 ua/2.1 api/codewhispererstreaming/0.1.12842 os/macos lang/rust/1.88.0 md/appVersion-1.21.0 app/AmazonQ-For-CLI";
const AMZ_USER_AGENT: &str = "aws-sdk-rust/1.3.10 ua/2.1 api/codewhispererstreaming/0.1.12842 os/macos lang/rust/1.88.0 m/F app/AmazonQ-For-CLI";

const GENERATE_TARGET: &str = "AmazonCodeWhispererStreamingService.GenerateAssistantResponse";
const LIST_MODELS_TARGET: &str = "AmazonCodeWhispererService.ListAvailableModels";
const LIST_MODELS_URL: &str = "https://q.us-east-1.amazonaws.com?origin=KIRO_CLI";

/// Attempts per conversational call before the error is surfaced
const MAX_ATTEMPTS: u32 = 3;

/// Builds an outbound client honouring `PROXY_URL` (http or socks).
///
/// HTTP/1.1 is forced so the upstream never sees an h2 connection; the
/// gzip accept-encoding the upstream expects comes from reqwest's own
/// decompression support.
pub fn build_proxied_client(proxy_url: Option<&str>, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder()
        .http1_only()
        .connect_timeout(Duration::from_secs(30))
        .timeout(timeout);

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .with_context(|| format!("invalid PROXY_URL: {}", proxy_url))?;
        builder = builder.proxy(proxy);
    }

    builder.build().context("Failed to build HTTP client")
}

/// Issues conversational calls against Amazon Q with credential rotation
pub struct UpstreamClient {
    client: Client,
    store: Arc<CredentialStore>,
    q_url: String,
}

impl UpstreamClient {
    pub fn new(client: Client, store: Arc<CredentialStore>, q_url: String) -> Self {
        Self {
            client,
            store,
            q_url,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// POSTs the conversation state and hands back the raw streaming body.
    ///
    /// Up to three attempts, each with a freshly acquired credential; error
    /// bodies are scanned for eviction markers before retrying. Network
    /// errors surface immediately.
    pub async fn generate_assistant_response(
        &self,
        payload: &QApiRequest,
    ) -> Result<reqwest::Response, ApiError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to encode request: {}", e)))?;

        let mut last_status = 0u16;
        let mut last_body = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            let bearer = self.store.acquire().await?;

            let response = self
                .client
                .post(&self.q_url)
                .header("user-agent", USER_AGENT)
                .header("accept", "*/*")
                .header("content-type", "application/x-amz-json-1.0")
                .header("x-amz-target", GENERATE_TARGET)
                .header("x-amz-user-agent", AMZ_USER_AGENT)
                .header("x-amzn-codewhisperer-optout", "true")
                .header("amz-sdk-request", "attempt=1; max=3")
                .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
                .bearer_auth(&bearer)
                .body(body.clone())
                .send()
                .await
                .map_err(|e| {
                    ApiError::Internal(anyhow::anyhow!("upstream request failed: {}", e))
                })?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let text = response.text().await.unwrap_or_default();
            tracing::error!(
                "Upstream returned {} on attempt {}/{}: {}",
                status,
                attempt + 1,
                MAX_ATTEMPTS,
                text
            );
            self.store.report_bad(&text, &bearer).await;

            last_status = status.as_u16();
            last_body = text;
        }

        Err(ApiError::Upstream {
            status: last_status,
            message: last_body,
        })
    }

    /// Fetches the upstream model list
    pub async fn list_models(&self) -> Result<QModelsResponse, ApiError> {
        let bearer = self.store.acquire().await?;

        let response = self
            .client
            .post(LIST_MODELS_URL)
            .header("user-agent", USER_AGENT)
            .header("Content-Type", "application/x-amz-json-1.0")
            .header("x-amz-target", LIST_MODELS_TARGET)
            .header("x-amz-user-agent", AMZ_USER_AGENT)
            .header("x-amzn-codewhisperer-optout", "true")
            .header("amz-sdk-request", "attempt=1; max=3")
            .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
            .bearer_auth(&bearer)
            .json(&serde_json::json!({"origin": "KIRO_CLI"}))
            .send()
            .await
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("model list request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            self.store.report_bad(&text, &bearer).await;
            return Err(ApiError::Upstream {
                status: status.as_u16(),
                message: text,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("model list parse failed: {}", e)))
    }
}
