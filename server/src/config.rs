//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen port.
    /// Override: `ROOM_SERVER_PORT`
    pub room_server_port: u16,

    /// RabbitMQ connection URL for the invalidation bus.
    /// Override: `RABBITMQ_URL`
    pub rabbitmq_url: String,

    /// Base URL of the storage/playlist interface.
    /// Override: `STORAGE_BASE_URL`
    pub storage_base_url: String,

    /// Milliseconds a Device persists after its last socket closes.
    /// Override: `ROOM_GRACE_INTERVAL`
    pub room_grace_interval_ms: u64,

    /// Milliseconds added to `startAt` on transitions.
    /// Override: `JOIN_LATENCY_BUDGET`
    pub join_latency_budget_ms: u64,

    /// Max frames queued per socket before eviction.
    /// Override: `OUTBOUND_QUEUE_MAX`
    pub outbound_queue_max: usize,

    /// Milliseconds of ping/pong recency the server considers "current".
    /// Override: `PING_WINDOW`
    pub ping_window_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = roomcast_core::Config::default();
        Self {
            room_server_port: core.room_server_port,
            rabbitmq_url: core.rabbitmq_url,
            storage_base_url: core.storage_base_url,
            room_grace_interval_ms: core.room_grace_interval.as_millis() as u64,
            join_latency_budget_ms: core.join_latency_budget.as_millis() as u64,
            outbound_queue_max: core.outbound_queue_max,
            ping_window_ms: core.ping_window.as_millis() as u64,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ROOM_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.room_server_port = port;
            }
        }
        if let Ok(val) = std::env::var("RABBITMQ_URL") {
            self.rabbitmq_url = val;
        }
        if let Ok(val) = std::env::var("STORAGE_BASE_URL") {
            self.storage_base_url = val;
        }
        if let Ok(val) = std::env::var("ROOM_GRACE_INTERVAL") {
            if let Ok(ms) = val.parse() {
                self.room_grace_interval_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("JOIN_LATENCY_BUDGET") {
            if let Ok(ms) = val.parse() {
                self.join_latency_budget_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("OUTBOUND_QUEUE_MAX") {
            if let Ok(max) = val.parse() {
                self.outbound_queue_max = max;
            }
        }
        if let Ok(val) = std::env::var("PING_WINDOW") {
            if let Ok(ms) = val.parse() {
                self.ping_window_ms = ms;
            }
        }
    }

    /// Converts to `roomcast-core`'s `Config` type.
    pub fn to_core_config(&self) -> roomcast_core::Config {
        roomcast_core::Config {
            room_server_port: self.room_server_port,
            rabbitmq_url: self.rabbitmq_url.clone(),
            storage_base_url: self.storage_base_url.clone(),
            room_grace_interval: Duration::from_millis(self.room_grace_interval_ms),
            join_latency_budget: Duration::from_millis(self.join_latency_budget_ms),
            outbound_queue_max: self.outbound_queue_max,
            ping_window: Duration::from_millis(self.ping_window_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_core_default() {
        let server = ServerConfig::default();
        let core = server.to_core_config();
        assert_eq!(core.room_server_port, roomcast_core::Config::default().room_server_port);
    }
}
