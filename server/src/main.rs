//! Roomcast Server - standalone headless binary for the synchronized
//! playback coordinator.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use roomcast_core::{bootstrap_services, start_server, AppState, WsConnectionManager};
use tokio::signal;
use tokio::time::interval;

use crate::config::ServerConfig;

/// Roomcast Server - headless synchronized-playback coordinator.
#[derive(Parser, Debug)]
#[command(name = "roomcast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ROOM_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// TCP listen port (overrides config file).
    #[arg(short = 'p', long, env = "ROOM_SERVER_PORT")]
    port: Option<u16>,

    /// RabbitMQ connection URL (overrides config file).
    #[arg(short = 'b', long, env = "RABBITMQ_URL")]
    bus_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Roomcast Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(port) = args.port {
        config.room_server_port = port;
    }
    if let Some(bus_url) = args.bus_url {
        config.rabbitmq_url = bus_url;
    }

    let core_config = config.to_core_config();
    let services = bootstrap_services(&core_config);

    log::info!("Services bootstrapped successfully");

    let sync_bridge = services.sync_bridge.clone();
    let shutdown_for_bridge = services.cancel_token.clone();
    let bridge_handle = tokio::spawn(async move {
        sync_bridge.run(shutdown_for_bridge).await;
    });

    let roster = services.roster.clone();
    let grace_interval = core_config.room_grace_interval;
    let shutdown_for_sweep = services.cancel_token.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = interval(grace_interval);
        loop {
            tokio::select! {
                _ = shutdown_for_sweep.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = roster.sweep_empty_rooms(grace_interval);
                    if !removed.is_empty() {
                        log::info!("[Roster] swept {} empty room(s)", removed.len());
                    }
                }
            }
        }
    });

    log::info!("Background tasks started");

    let app_state = AppState::new(
        &services,
        Arc::new(WsConnectionManager::new()),
        Arc::new(core_config),
    );

    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("HTTP server started on port {}", config.room_server_port);

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown();
    bridge_handle.abort();
    sweep_handle.abort();
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
