//! Convoy Scheduler
//!
//! Serves the scheduler HTTP API and runs the decision loop and discovery
//! polling until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use convoy_scheduler::{
    api,
    config::Config,
    discovery::{self, HttpDiscovery, StaticDiscovery},
    state::AppState,
    HttpHostAgent, Scheduler,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CONVOY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting convoy scheduler");
    info!(
        listen_addr = %config.listen_addr,
        backoff_period_ms = config.scheduler.backoff.base().as_millis() as u64,
        discovery_url = ?config.discovery_url,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let agent = HttpHostAgent::new(config.agent_timeout).context("building agent client")?;
    let (scheduler, scheduler_task) =
        Scheduler::spawn(config.scheduler, Arc::new(agent), shutdown_rx.clone());

    let discovery_handle = match &config.discovery_url {
        Some(url) => {
            let source = HttpDiscovery::new(url, config.agent_timeout)
                .context("building discovery client")?;
            tokio::spawn(discovery::run_discovery_loop(
                source,
                scheduler.clone(),
                config.discovery_poll,
                shutdown_rx.clone(),
            ))
        }
        None => {
            let source =
                StaticDiscovery::parse(&config.static_hosts).context("CONVOY_STATIC_HOSTS")?;
            tokio::spawn(discovery::run_discovery_loop(
                source,
                scheduler.clone(),
                config.discovery_poll,
                shutdown_rx.clone(),
            ))
        }
    };

    let app = api::create_router(AppState::new(scheduler));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, discovery_handle).await {
        warn!(error = %e, "Discovery loop did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, scheduler_task).await {
        warn!(error = %e, "Scheduler did not shut down in time");
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
