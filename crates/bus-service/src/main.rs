//! Rendezvous Bus Service
//!
//! Runs one bus attachment over the loopback transport and hosts a session
//! port for the configured application.
//!
//! # Servers
//!
//! - HTTP server for health, metrics and status (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Create the bus attachment and pump loopback discovery into it
//! 4. Start health HTTP server (liveness, readiness, metrics, status)
//! 5. Register `SessionOps` for all three listener roles
//! 6. Bind the session port, optionally advertise a name
//! 7. Mark ready and wait for shutdown signal
//! 8. Tear the attachment down within the configured deadline

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use bus_service::config::Config;
use bus_service::observability::{health_router, init_metrics_recorder, HealthState};
use bus_service::session_ops::SessionOps;
use bus_service::transport::LoopbackTransport;
use bus_service::BusAttachment;
use common::types::{SessionOpts, TransportMask};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bus_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rendezvous Bus Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        application = %config.application_name,
        unique_name = %config.unique_name,
        session_port = config.session_port,
        health_bind_address = %config.health_bind_address,
        accept_timeout_ms = config.accept_timeout_ms,
        establish_timeout_ms = config.establish_timeout_ms,
        name_table_shards = config.name_table_shards,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Create the attachment and feed it loopback discovery
    let attachment_config = config.attachment_config();
    let teardown_deadline = attachment_config.teardown_deadline;
    let (transport, discovery_rx) = LoopbackTransport::new();
    let attachment = Arc::new(BusAttachment::new(attachment_config, Arc::new(transport)));
    let discovery_task = attachment.spawn_discovery_pump(discovery_rx);
    info!(unique_name = %attachment.unique_name(), "Bus attachment started");

    let shutdown_token = attachment.child_token();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let status_attachment = Arc::clone(&attachment);
    let ops_router = Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || {
                let handle = prometheus_handle.clone();
                async move { handle.render() }
            }),
        )
        .route(
            "/status",
            axum::routing::get(move || {
                let attachment = Arc::clone(&status_attachment);
                async move { axum::Json(attachment.status()) }
            }),
        );

    let app = health_router(Arc::clone(&health_state), Arc::clone(&attachment)).merge(ops_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // One coordinator serves all three listener roles
    let ops = Arc::new(SessionOps::new());
    attachment.register_bus_listener(Arc::clone(&ops) as _)?;
    attachment.register_session_listener(Arc::clone(&ops) as _)?;

    let port = attachment
        .bind_session_port(
            config.session_port,
            SessionOpts::new(true),
            Arc::clone(&ops) as _,
        )
        .map_err(|e| {
            error!(error = %e, port = config.session_port, "Failed to bind session port");
            e
        })?;
    ops.host_port(port);
    info!(port, "Session port bound");

    if let Some(name) = &config.advertised_name {
        attachment.find_advertised_name(name).await?;
        attachment
            .advertise_name(name, TransportMask::ANY)
            .await
            .map_err(|e| {
                error!(error = %e, name = %name, "Failed to advertise name");
                e
            })?;
    }

    health_state.set_ready();

    // Wait for shutdown signal
    info!("Rendezvous Bus Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Report not ready before teardown starts unbinding ports
    health_state.set_not_ready();

    match attachment.teardown(teardown_deadline).await {
        Ok(report) if !report.completed_within_deadline => {
            warn!(
                elapsed_ms = report.elapsed_ms,
                "Teardown cut short by deadline"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Teardown error"),
    }

    if let Err(e) = discovery_task.await {
        warn!(error = %e, "Discovery pump ended abnormally");
    }
    if let Err(e) = health_task.await {
        warn!(error = %e, "Health server task ended abnormally");
    }

    info!("Rendezvous Bus Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
