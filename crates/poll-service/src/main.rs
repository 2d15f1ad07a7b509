//! Live Poll Service
//!
//! HTTP API plus Server-Sent Events for live polls.
//!
//! # Servers
//!
//! - HTTP API and live streams (default: 0.0.0.0:8080)
//! - Health and metrics endpoints (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Initialize Prometheus metrics recorder
//! 4. Connect to Redis when `REDIS_URL` is set (durable mode)
//! 5. Start the poll service (registry, hub, lifecycle task)
//! 6. Start health server, then API server
//! 7. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::secret::ExposeSecret;
use poll_service::config::Config;
use poll_service::observability::metrics::init_metrics_recorder;
use poll_service::observability::{health_router, HealthState};
use poll_service::routes::{build_routes, AppState};
use poll_service::service::{PollService, ServiceSettings};
use poll_service::storage::RedisPollStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long live polls get to stop on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first so the log format can follow it
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "poll_service=debug,tower_http=debug".into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Poll Service");
    info!(
        instance_id = %config.instance_id,
        http_bind_address = %config.http_bind_address,
        health_bind_address = %config.health_bind_address,
        durable = config.redis_url.is_some(),
        max_active_polls = config.max_active_polls,
        operation_timeout_ms = config.operation_timeout_ms,
        ephemeral_idle_timeout_seconds = config.ephemeral_idle_timeout_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let voting_secret = config.voting_token_master_secret().map_err(|e| {
        error!(error = %e, "Invalid voting token secret");
        e
    })?;

    let mut builder =
        PollService::builder(voting_secret).settings(ServiceSettings::from_config(&config));

    if let Some(redis_url) = &config.redis_url {
        info!("Connecting to Redis...");
        let store = RedisPollStore::new(redis_url.expose_secret())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?;
        store.ping().await?;
        builder = builder.store(Arc::new(store));
        info!("Redis connection established, polls are durable");
    } else {
        warn!("REDIS_URL not set, polls are ephemeral and lost on restart");
    }

    let service = builder.build()?;
    let health_state = Arc::new(HealthState::for_service(service.clone()));
    let shutdown_token = CancellationToken::new();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // API server
    let http_addr: SocketAddr = config.http_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.http_bind_address, "Invalid HTTP bind address");
        format!("Invalid HTTP bind address: {e}")
    })?;
    let api_app = build_routes(Arc::new(AppState {
        service: service.clone(),
    }));
    let api_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %http_addr, "Failed to bind HTTP server");
            format!("Failed to bind HTTP server to {http_addr}: {e}")
        })?;

    let api_shutdown_token = shutdown_token.child_token();
    let api_task = tokio::spawn(async move {
        info!(addr = %http_addr, "HTTP server starting");
        let server = axum::serve(api_listener, api_app).with_graceful_shutdown(async move {
            api_shutdown_token.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    health_state.set_ready();
    info!("Poll Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer stops sending traffic
    health_state.set_not_ready();

    // Closing every live stream first lets the HTTP server finish draining
    service.shutdown(SHUTDOWN_DEADLINE).await;
    shutdown_token.cancel();

    for (name, task) in [("http", api_task), ("health", health_task)] {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!(server = name, "Server did not stop within timeout");
        }
    }

    info!("Poll Service shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
