//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to services.
//! It provides the router construction and server startup functionality.

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::roster::Roster;
use crate::storage::StorageClient;
use crate::sync_bridge::SyncBridge;

pub mod http;
pub mod response;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// A thin wrapper that holds references to services. All business logic
/// lives in the services themselves (the Roster, the Rooms it owns, and the
/// Sync bridge).
#[derive(Clone)]
pub struct AppState {
    /// Tracks every live Room.
    pub roster: Arc<Roster>,
    /// The storage-interface client, used directly by REST handlers that
    /// need data the Roster/Room layer doesn't cache (e.g. playlist lookups).
    pub storage: Arc<dyn StorageClient>,
    /// Resolves `playlistKey` to a playlist id and keeps Rooms fed with
    /// queue updates from the invalidation bus.
    pub sync_bridge: Arc<SyncBridge>,
    /// Tracks active WebSocket connections for force-close on shutdown.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Application configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds an `AppState` from a bootstrap result and a connection manager.
    pub fn new(
        services: &crate::bootstrap::BootstrappedServices,
        ws_manager: Arc<WsConnectionManager>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            roster: Arc::clone(&services.roster),
            storage: Arc::clone(&services.storage),
            sync_bridge: Arc::clone(&services.sync_bridge),
            ws_manager,
            config,
        }
    }
}

/// Starts the HTTP server on the configured port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.config.room_server_port;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("[Server] listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
