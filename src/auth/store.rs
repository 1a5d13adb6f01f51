// Credential store
//
// Holds the full account pool plus the active working set that actually
// serves requests. All pool mutation happens under one writer lock; disk
// persistence runs behind its own lock so CSV/cache rewrites never collide
// with each other or stall a request.

use chrono::Utc;
use rand::Rng;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use crate::config::{AccountSource, Config};
use crate::error::ApiError;

use super::refresh::{exchange, exchange_with_attempts, DEFAULT_OIDC_URL};
use super::sources;
use super::types::Credential;

/// Upstream error-body markers that burn a credential
const EVICTION_PATTERNS: &[&str] = &["MONTHLY_REQUEST_COUNT", "TEMPORARILY_SUSPENDED"];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub source: AccountSource,
    pub csv_path: Option<PathBuf>,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub category_id: Option<String>,
    pub cache_path: PathBuf,
    pub active_token_count: usize,
    pub max_refresh_attempts: u32,
    pub oidc_url: String,
}

impl StoreConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source: config.account_source.clone(),
            csv_path: config.accounts_csv_path.clone(),
            api_url: config.account_api_url.clone(),
            api_token: config.account_api_token.clone(),
            category_id: config.account_category_id.clone(),
            cache_path: PathBuf::from(sources::API_CACHE_PATH),
            active_token_count: config.active_token_count,
            max_refresh_attempts: config.max_refresh_attempt,
            oidc_url: DEFAULT_OIDC_URL.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    pool: Vec<Credential>,
    /// Pool indices currently eligible to serve
    active: Vec<usize>,
    /// Round-robin cursor over the valid view of the active set
    cursor: usize,
    /// First pool entry not yet promoted to the active set
    next_pool_index: usize,
}

pub struct CredentialStore {
    inner: RwLock<PoolState>,
    /// Serialises CSV and cache rewrites
    disk: Arc<Mutex<()>>,
    http: Client,
    cfg: StoreConfig,
}

impl CredentialStore {
    /// Loads the pool and exchanges the initial active set.
    ///
    /// Fails fast when no credentials load at all; individual exchange
    /// failures only shrink the active set.
    pub async fn init(cfg: StoreConfig, http: Client) -> anyhow::Result<Arc<Self>> {
        let mut pool = match cfg.source {
            AccountSource::Csv => {
                let path = cfg
                    .csv_path
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("csv mode without ACCOUNTS_CSV_PATH"))?;
                tracing::info!("Loading accounts from CSV: {}", path.display());
                sources::load_from_csv(path).await?
            }
            AccountSource::Api => {
                let api_url = cfg
                    .api_url
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("api mode without ACCOUNT_API_URL"))?;
                let api_token = cfg
                    .api_token
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("api mode without ACCOUNT_API_TOKEN"))?;

                let mut pool = sources::load_cache(&cfg.cache_path).await;
                tracing::info!(
                    "Loaded {} account(s) from cache, target {}",
                    pool.len(),
                    cfg.active_token_count
                );

                if pool.len() < cfg.active_token_count {
                    let fetched = sources::fetch_from_broker(
                        &http,
                        api_url,
                        api_token,
                        cfg.category_id.as_deref(),
                        cfg.active_token_count - pool.len(),
                    )
                    .await?;
                    tracing::info!("Fetched {} account(s) from broker", fetched.len());
                    pool.extend(fetched);
                    sources::write_cache(&cfg.cache_path, &pool).await.ok();
                }
                pool
            }
        };

        if pool.is_empty() {
            anyhow::bail!("no credentials loaded");
        }

        let initial = cfg.active_token_count.min(pool.len());
        let mut active = Vec::with_capacity(initial);
        for (i, cred) in pool.iter_mut().take(initial).enumerate() {
            match exchange_with_attempts(&http, &cfg.oidc_url, cred, cfg.max_refresh_attempts).await
            {
                Ok(grant) => {
                    cred.access_token = grant.access_token;
                    cred.expires_at = grant.expires_at;
                    active.push(i);
                    tracing::info!("Activated credential {}", i);
                }
                Err(e) => {
                    tracing::warn!("Skipping credential {}: {}", i, e);
                }
            }
        }

        tracing::info!(
            "Credential store ready: pool={}, active={}",
            pool.len(),
            active.len()
        );

        Ok(Arc::new(Self {
            inner: RwLock::new(PoolState {
                pool,
                active,
                cursor: 0,
                next_pool_index: initial,
            }),
            disk: Arc::new(Mutex::new(())),
            http: http.clone(),
            cfg,
        }))
    }

    #[cfg(test)]
    pub fn for_testing(cfg: StoreConfig, pool: Vec<Credential>, active: Vec<usize>) -> Arc<Self> {
        let next_pool_index = active.len();
        Arc::new(Self {
            inner: RwLock::new(PoolState {
                pool,
                active,
                cursor: 0,
                next_pool_index,
            }),
            disk: Arc::new(Mutex::new(())),
            http: Client::new(),
            cfg,
        })
    }

    /// Returns an access token, round-robin over active entries that are
    /// neither disabled nor expired
    pub async fn acquire(&self) -> Result<String, ApiError> {
        let mut state = self.inner.write().await;
        let now = Utc::now().timestamp();

        let valid: Vec<usize> = state
            .active
            .iter()
            .copied()
            .filter(|&idx| {
                let cred = &state.pool[idx];
                !cred.disabled && cred.expires_at > now
            })
            .collect();

        if valid.is_empty() {
            return Err(ApiError::CredentialUnavailable);
        }

        state.cursor = (state.cursor + 1) % valid.len();
        Ok(state.pool[valid[state.cursor]].access_token.clone())
    }

    /// Inspects an upstream error body and, if it matches an eviction
    /// pattern, disables the offending credential, persists the disable, and
    /// backfills its active slot from the pool
    pub async fn report_bad(self: &Arc<Self>, body: &str, access_token: &str) {
        let Some(reason) = EVICTION_PATTERNS.iter().find(|p| body.contains(**p)) else {
            return;
        };

        let mut state = self.inner.write().await;

        let Some(pos) = state
            .active
            .iter()
            .position(|&idx| state.pool[idx].access_token == access_token)
        else {
            return;
        };

        let idx = state.active[pos];
        tracing::warn!("Disabling active credential {}, reason: {}", idx, reason);
        state.pool[idx].disabled = true;
        state.pool[idx].expires_at = 0;

        self.spawn_persist_disable(&state.pool, idx);

        // Backfill the slot from the next unused, non-disabled pool entry.
        while state.next_pool_index < state.pool.len() {
            let candidate = state.next_pool_index;
            state.next_pool_index += 1;
            if state.pool[candidate].disabled {
                continue;
            }

            match exchange_with_attempts(
                &self.http,
                &self.cfg.oidc_url,
                &state.pool[candidate],
                self.cfg.max_refresh_attempts,
            )
            .await
            {
                Ok(grant) => {
                    state.pool[candidate].access_token = grant.access_token;
                    state.pool[candidate].expires_at = grant.expires_at;
                    state.active[pos] = candidate;
                    tracing::info!("Rotated slot to pool credential {}", candidate);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Replacement credential {} unusable: {}", candidate, e);
                    break;
                }
            }
        }

        // Pool exhausted (or the replacement failed): the slot just goes away.
        state.active.remove(pos);
        tracing::warn!("Active set shrunk to {} credential(s)", state.active.len());

        if self.cfg.source == AccountSource::Api {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                store.fetch_and_add_one().await;
            });
        }
    }

    /// Persists a disable without blocking the caller
    fn spawn_persist_disable(&self, pool: &[Credential], idx: usize) {
        let refresh_token = pool[idx].refresh_token.clone();
        let broker_id = pool[idx].id;
        let pool_snapshot: Vec<Credential> = pool.to_vec();
        let cfg = self.cfg.clone();
        let http = self.http.clone();
        let disk = Arc::clone(&self.disk);

        tokio::spawn(async move {
            let _guard = disk.lock().await;
            match cfg.source {
                AccountSource::Csv => {
                    if let Some(path) = &cfg.csv_path {
                        if let Err(e) = sources::disable_in_csv(path, &refresh_token).await {
                            tracing::error!("Failed to persist CSV disable: {}", e);
                        }
                    }
                }
                AccountSource::Api => {
                    if let Err(e) = sources::write_cache(&cfg.cache_path, &pool_snapshot).await {
                        tracing::error!("Failed to rewrite account cache: {}", e);
                    }
                    if let (Some(api_url), Some(api_token), Some(id)) =
                        (&cfg.api_url, &cfg.api_token, broker_id)
                    {
                        if let Err(e) =
                            sources::report_banned_to_broker(&http, api_url, api_token, id).await
                        {
                            tracing::error!("Failed to report ban to broker: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Pulls one more account from the broker and promotes it
    async fn fetch_and_add_one(self: Arc<Self>) {
        let (Some(api_url), Some(api_token)) =
            (self.cfg.api_url.clone(), self.cfg.api_token.clone())
        else {
            return;
        };

        let fetched = match sources::fetch_from_broker(
            &self.http,
            &api_url,
            &api_token,
            self.cfg.category_id.as_deref(),
            1,
        )
        .await
        {
            Ok(fetched) if !fetched.is_empty() => fetched,
            Ok(_) => {
                tracing::warn!("Broker returned no replacement account");
                return;
            }
            Err(e) => {
                tracing::error!("Failed to fetch replacement account: {}", e);
                return;
            }
        };

        let mut state = self.inner.write().await;
        state.pool.extend(fetched);
        let candidate = state.pool.len() - 1;

        match exchange_with_attempts(
            &self.http,
            &self.cfg.oidc_url,
            &state.pool[candidate],
            self.cfg.max_refresh_attempts,
        )
        .await
        {
            Ok(grant) => {
                state.pool[candidate].access_token = grant.access_token;
                state.pool[candidate].expires_at = grant.expires_at;
                state.active.push(candidate);
                tracing::info!("Added broker credential {} to active set", candidate);
            }
            Err(e) => {
                tracing::error!("Fetched broker credential unusable: {}", e);
            }
        }
        state.next_pool_index = state.pool.len();

        let snapshot = state.pool.clone();
        drop(state);

        let disk = Arc::clone(&self.disk);
        let cache_path = self.cfg.cache_path.clone();
        tokio::spawn(async move {
            let _guard = disk.lock().await;
            sources::write_cache(&cache_path, &snapshot).await.ok();
        });
    }

    /// Spawns the periodic re-refresh task: sleep a random 20-40 minutes,
    /// then exchange every non-disabled active entry. Failures are logged,
    /// never propagated.
    pub fn spawn_background_refresh(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let minutes = rand::thread_rng().gen_range(20..40);
                sleep(Duration::from_secs(minutes * 60)).await;

                let snapshot: Vec<(usize, Credential)> = {
                    let state = store.inner.read().await;
                    state
                        .active
                        .iter()
                        .copied()
                        .filter(|&idx| !state.pool[idx].disabled)
                        .map(|idx| (idx, state.pool[idx].clone()))
                        .collect()
                };

                for (idx, cred) in snapshot {
                    match exchange(&store.http, &store.cfg.oidc_url, &cred).await {
                        Ok(grant) => {
                            let mut state = store.inner.write().await;
                            if !state.pool[idx].disabled {
                                state.pool[idx].access_token = grant.access_token;
                                state.pool[idx].expires_at = grant.expires_at;
                                tracing::info!("Refreshed active credential {}", idx);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to refresh active credential {}: {}", idx, e);
                        }
                    }
                }
            }
        });
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.active.len()
    }

    #[cfg(test)]
    pub async fn credential(&self, idx: usize) -> Credential {
        self.inner.read().await.pool[idx].clone()
    }
}
