// Credential loading and disable persistence
//
// csv mode: rows of (enabled, refreshToken, clientId, clientSecret); the
// enabled column is rewritten in place when an account is banned.
// api mode: accounts come from a broker endpoint and are mirrored into a
// local JSON cache so restarts do not drain the broker.

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;
use std::path::Path;
use tokio::time::{sleep, Duration};

use super::types::{AccountRecord, BrokerAccount, Credential};

/// Local working cache for api mode
pub const API_CACHE_PATH: &str = "resources/api_accounts.json";

// ==================================================================================================
// CSV Source
// ==================================================================================================

/// Loads enabled accounts from the CSV file, waiting for it to appear
pub async fn load_from_csv(path: &Path) -> Result<Vec<Credential>> {
    while !path.exists() {
        tracing::warn!("CSV file does not exist: {}, waiting...", path.display());
        sleep(Duration::from_secs(10)).await;
    }

    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

    let mut credentials = Vec::new();
    for (i, line) in data.lines().enumerate() {
        // First row is the header
        if i == 0 {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 4 {
            continue;
        }
        if fields[0].trim() == "True" {
            credentials.push(Credential::new(
                fields[1].trim().to_string(),
                fields[2].trim().to_string(),
                fields[3].trim().to_string(),
            ));
        }
    }

    if credentials.is_empty() {
        anyhow::bail!("No enabled accounts found in CSV");
    }

    Ok(credentials)
}

/// Flips the enabled column to False for the row holding `refresh_token`
pub async fn disable_in_csv(path: &Path, refresh_token: &str) -> Result<()> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

    let mut lines: Vec<String> = data.lines().map(|l| l.to_string()).collect();
    for line in lines.iter_mut().skip(1) {
        if !line.contains(refresh_token) {
            continue;
        }
        let mut fields: Vec<&str> = line.split(',').collect();
        if fields.len() >= 4 && fields[1].trim() == refresh_token {
            fields[0] = "False";
            *line = fields.join(",");
            break;
        }
    }

    tokio::fs::write(path, lines.join("\n"))
        .await
        .with_context(|| format!("Failed to rewrite CSV file: {}", path.display()))
}

// ==================================================================================================
// Broker API Source
// ==================================================================================================

/// Fetches `count` fresh accounts from the broker
pub async fn fetch_from_broker(
    client: &Client,
    api_url: &str,
    api_token: &str,
    category_id: Option<&str>,
    count: usize,
) -> Result<Vec<Credential>> {
    let body = json!({
        "category_id": category_id,
        "count": count,
    });

    let response = client
        .post(api_url)
        .bearer_auth(api_token)
        .json(&body)
        .send()
        .await
        .context("Failed to fetch accounts from broker")?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("broker returned status {}: {}", status, text);
    }

    let accounts: Vec<BrokerAccount> = response
        .json()
        .await
        .context("Failed to parse broker response")?;

    let mut credentials = Vec::new();
    for account in accounts {
        let record: AccountRecord = match serde_json::from_str(&account.data) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping broker account {}: bad data field: {}", account.id, e);
                continue;
            }
        };
        credentials.push(Credential {
            id: Some(account.id),
            refresh_token: record.refresh_token,
            client_id: record.client_id,
            client_secret: record.client_secret.replace('\r', ""),
            access_token: String::new(),
            expires_at: 0,
            disabled: false,
        });
    }

    Ok(credentials)
}

/// Reports accounts as banned so the broker stops handing them out
pub async fn report_banned_to_broker(
    client: &Client,
    api_url: &str,
    api_token: &str,
    id: i64,
) -> Result<()> {
    let url = format!("{}/update", api_url.trim_end_matches('/'));
    let response = client
        .put(&url)
        .bearer_auth(api_token)
        .json(&json!({"ids": [id], "banned": true}))
        .send()
        .await
        .context("Failed to report banned account to broker")?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("broker update returned status {}", status);
    }
    Ok(())
}

// ==================================================================================================
// Local API Cache
// ==================================================================================================

/// Reads the local account cache; a missing or unreadable file is empty
pub async fn load_cache(path: &Path) -> Vec<Credential> {
    let Ok(data) = tokio::fs::read_to_string(path).await else {
        return Vec::new();
    };

    let records: Vec<AccountRecord> = match serde_json::from_str(&data) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!("Ignoring unreadable account cache {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    records
        .into_iter()
        .map(|record| Credential {
            id: record.id,
            refresh_token: record.refresh_token,
            client_id: record.client_id,
            client_secret: record.client_secret,
            access_token: String::new(),
            expires_at: 0,
            disabled: false,
        })
        .collect()
}

/// Rewrites the local account cache from the current pool, skipping disabled
/// entries
pub async fn write_cache(path: &Path, credentials: &[Credential]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let records: Vec<AccountRecord> = credentials
        .iter()
        .filter(|c| !c.disabled)
        .map(|c| AccountRecord {
            id: c.id,
            refresh_token: c.refresh_token.clone(),
            client_id: c.client_id.clone(),
            client_secret: c.client_secret.clone(),
        })
        .collect();

    let data = serde_json::to_string_pretty(&records)?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Failed to write account cache: {}", path.display()))
}
