// Refresh-token to access-token exchange against AWS SSO OIDC

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use uuid::Uuid;

use super::types::{Credential, TokenRefreshRequest, TokenRefreshResponse};

pub const DEFAULT_OIDC_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";

/// A freshly exchanged access token
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access_token: String,
    pub expires_at: i64,
}

/// Exchanges a refresh token for an access token
pub async fn exchange(client: &Client, oidc_url: &str, cred: &Credential) -> Result<AccessGrant> {
    let body = TokenRefreshRequest {
        client_id: cred.client_id.clone(),
        client_secret: cred.client_secret.clone(),
        grant_type: "refresh_token".to_string(),
        refresh_token: cred.refresh_token.clone(),
    };

    let response = client
        .post(oidc_url)
        .header("Content-Type", "application/json")
        .header("user-agent", "aws-sdk-rust/1.3.9 os/macos lang/rust/1.87.0")
        .header(
            "x-amz-user-agent",
            "aws-sdk-rust/1.3.9 ua/2.1 api/ssooidc/1.89.0 os/macos lang/rust/1.87.0 m/E app/AmazonQ-For-KIRO_CLI",
        )
        .header("amz-sdk-request", "attempt=1; max=3")
        .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
        .header("accept", "*/*")
        .json(&body)
        .send()
        .await
        .context("Failed to send token refresh request")?;

    let status = response.status();
    let text = response
        .text()
        .await
        .context("Failed to read token refresh response")?;

    if !status.is_success() {
        anyhow::bail!("token refresh failed with status {}: {}", status, text);
    }

    let parsed: TokenRefreshResponse =
        serde_json::from_str(&text).context("Failed to parse token refresh response")?;

    Ok(AccessGrant {
        access_token: parsed.access_token,
        expires_at: Utc::now().timestamp() + parsed.expires_in,
    })
}

/// Exchange with bounded retries; every failure is logged
pub async fn exchange_with_attempts(
    client: &Client,
    oidc_url: &str,
    cred: &Credential,
    max_attempts: u32,
) -> Result<AccessGrant> {
    let mut last_err = anyhow::anyhow!("no refresh attempts made");
    for attempt in 1..=max_attempts.max(1) {
        match exchange(client, oidc_url, cred).await {
            Ok(grant) => return Ok(grant),
            Err(e) => {
                tracing::warn!(
                    "Failed to get access token (attempt {}/{}): {}",
                    attempt,
                    max_attempts,
                    e
                );
                last_err = e;
            }
        }
    }
    Err(last_err)
}
