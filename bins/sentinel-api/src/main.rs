mod handlers;
mod language_config;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use language_config::LanguageRegistry;
use redis::aio::ConnectionManager;
use sentinel_common::config::ServiceConfig;
use sentinel_common::types::IntakePolicy;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct AppState {
    pub redis: ConnectionManager,
    pub policy: IntakePolicy,
    pub languages: LanguageRegistry,
    pub result_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing subscriber
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }

    info!("Sentinel API booting...");

    let languages = LanguageRegistry::load_from_file(&config.languages_config)
        .context("Failed to load language configuration")?;
    info!("Accepting languages: {:?}", languages.enabled_languages());

    metrics::register().context("Failed to register metrics")?;

    // Connect to Redis
    let client = redis::Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis: {}", config.redis_url);

    let state = Arc::new(AppState {
        redis: redis_conn,
        policy: config.intake.clone(),
        languages,
        result_ttl_secs: config.result_ttl_secs,
    });

    // Build router
    let app = Router::new().merge(routes::routes()).with_state(state);

    // Start server
    let listener = TcpListener::bind(config.api_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_addr))?;
    info!("HTTP server listening on {}", config.api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal");
            }
        })
        .await
        .context("Server error")?;

    info!("API shutdown complete");
    Ok(())
}
