use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

mod auth;
mod config;
mod converters;
mod error;
mod http_client;
mod mcp;
mod middleware;
mod models;
mod routes;
mod streaming;
mod tokenizer;
mod validation;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = config::Config::load()?;
    config.validate()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    tracing::info!("q2api starting...");
    if let Some(proxy_url) = &config.proxy_url {
        tracing::info!("Using proxy: {}", proxy_url);
    }

    // Short-timeout client for token refresh, broker, and MCP calls
    let control_client =
        http_client::build_proxied_client(config.proxy_url.as_deref(), Duration::from_secs(30))?;

    tracing::info!("Initializing credential store...");
    let store =
        auth::CredentialStore::init(auth::StoreConfig::from_config(&config), control_client)
            .await?;

    if store.active_count().await == 0 {
        anyhow::bail!("Startup failed: no credential could be activated");
    }
    match store.acquire().await {
        Ok(token) => {
            tracing::info!(
                "Credential store ready (token: {}...)",
                &token[..20.min(token.len())]
            );
        }
        Err(e) => {
            anyhow::bail!("Startup failed: {}", e);
        }
    }

    store.spawn_background_refresh();

    // Long-timeout client for conversational round-trips
    let conversation_client =
        http_client::build_proxied_client(config.proxy_url.as_deref(), Duration::from_secs(300))?;

    let upstream = Arc::new(http_client::UpstreamClient::new(
        conversation_client,
        Arc::clone(&store),
        config.amazon_q_url.clone(),
    ));

    let state = routes::AppState {
        config: Arc::new(config.clone()),
        upstream,
    };

    let app = routes::build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
