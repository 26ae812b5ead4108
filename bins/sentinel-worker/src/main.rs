mod health;
mod worker;

use anyhow::Context;
use health::{Health, ReadyState};
use sentinel_common::config::ServiceConfig;
use sentinel_engine::toolchain::{ToolchainConfigManager, ToolchainRegistry};
use sentinel_engine::Executor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use worker::WorkerContext;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    init_tracing(config.log_json);

    info!("Sentinel Worker booting...");

    // Load toolchain configurations
    let manager = ToolchainConfigManager::load(&config.languages_config).map_err(|e| {
        error!("Failed to load toolchain configurations: {:#}", e);
        error!("Make sure {} exists", config.languages_config.display());
        e
    })?;
    info!("Configured toolchains: {:?}", manager.list_languages());

    let languages = config.worker_languages.clone();
    let registry = ToolchainRegistry::probe(&manager, &languages).await;
    for (language, version) in registry.available() {
        info!(%language, %version, "Toolchain ready");
    }

    let executor = Arc::new(Executor::from_config(&config, registry));
    let health = Arc::new(Health::default());

    // Crash recovery: anything left by a previous incarnation goes now
    let report = executor.sweep(config.workspace_max_age);
    info!(
        removed = report.workspaces.removed,
        kept = report.workspaces.kept,
        cache_temp_removed = report.cache_temp_removed,
        "Startup sweep finished"
    );

    if let Err(e) = executor.check_preconditions() {
        error!(error = %e, "Preconditions not met, starting with intake halted");
        health.halt(e.to_string());
    }

    // Connect to Redis
    let client = ::redis::Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let redis_conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis: {}", config.redis_url);

    // Readiness endpoint
    let listener = TcpListener::bind(config.worker_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.worker_addr))?;
    let ready = health::router(ReadyState {
        health: health.clone(),
        admission: executor.admission().clone(),
    });
    info!("Readiness endpoint listening on {}", config.worker_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, ready).await {
            error!(error = %e, "Readiness server failed");
        }
    });

    // Periodic cleanup sweep
    {
        let executor = executor.clone();
        let max_age = config.workspace_max_age;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let executor = executor.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || executor.sweep(max_age)).await {
                    error!(error = %e, "Cleanup sweep failed");
                }
            }
        });
    }

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Received shutdown signal, draining in-flight submissions...");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        });
    }

    let ctx = Arc::new(WorkerContext {
        executor,
        manager,
        languages,
        health,
        result_ttl_secs: config.result_ttl_secs,
    });
    worker::run(ctx, redis_conn, shutdown).await?;

    info!("Worker shutdown complete");
    Ok(())
}
