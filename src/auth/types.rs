// Credential types and token-refresh wire shapes

use serde::{Deserialize, Serialize};

/// One pooled account: the immutable refresh triple plus its mutable
/// access-token state
#[derive(Debug, Clone)]
pub struct Credential {
    /// Broker-assigned id (api mode only)
    pub id: Option<i64>,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,

    pub access_token: String,
    /// Epoch seconds; 0 means never exchanged or force-expired
    pub expires_at: i64,
    pub disabled: bool,
}

impl Credential {
    pub fn new(refresh_token: String, client_id: String, client_secret: String) -> Self {
        Self {
            id: None,
            refresh_token,
            client_id,
            client_secret,
            access_token: String::new(),
            expires_at: 0,
            disabled: false,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefreshRequest {
    pub client_id: String,
    pub client_secret: String,
    pub grant_type: String,
    pub refresh_token: String,
}

/// The refresh endpoint returns more (refreshToken, tokenType, idToken);
/// only the fields the pool consumes are kept.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefreshResponse {
    pub access_token: String,
    pub expires_in: i64,
}

/// One account row as the broker returns it; `data` is a JSON string
/// carrying the refresh triple
#[derive(Debug, Deserialize)]
pub struct BrokerAccount {
    pub id: i64,
    pub data: String,
}

/// The refresh triple inside a broker account's `data` field, also the row
/// shape of the local api-accounts cache
#[derive(Debug, Serialize, Deserialize)]
pub struct AccountRecord {
    #[serde(default)]
    pub id: Option<i64>,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
}
