//! Application bootstrap and dependency wiring.
//!
//! The composition root: the one place all services are instantiated and
//! wired together, in dependency order (leaves first, matching the
//! component order in the system overview): storage client, invalidation
//! bus connector, Roster, Sync bridge.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::{InvalidationBusConnector, LapinConnector};
use crate::config::Config;
use crate::room::StorageWriter;
use crate::roster::Roster;
use crate::storage::{HttpStorageClient, StorageClient};
use crate::sync_bridge::SyncBridge;

/// All wired services, ready for the edge layer to build a router on top of.
#[derive(Clone)]
pub struct BootstrappedServices {
    pub roster: Arc<Roster>,
    pub storage: Arc<dyn StorageClient>,
    pub sync_bridge: Arc<SyncBridge>,
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Signals every background task (the sync bridge's reconnect loop, the
    /// roster's GC sweep) to stop.
    pub fn shutdown(&self) {
        log::info!("[Bootstrap] shutting down");
        self.cancel_token.cancel();
    }
}

/// Thin [`StorageWriter`] over the storage client, used by every Room.
///
/// Rooms only need "mark this song played"; routing that call through the
/// Sync bridge would make Room depend on the bridge's full type and the
/// bridge depend on the Roster at construction time, a genuine cycle. This
/// adapter has no dependency on the Roster or bridge at all, so both can be
/// built straightforwardly in dependency order.
struct StorageWriteBackAdapter {
    storage: Arc<dyn StorageClient>,
}

#[async_trait]
impl StorageWriter for StorageWriteBackAdapter {
    async fn mark_song_played(&self, song_id: &str) {
        if let Err(e) = self.storage.update_song_status(song_id, "played").await {
            log::warn!("[Room] failed to mark {} played: {}", song_id, e);
        }
    }
}

/// Wires the coordinator's services from `config`. Does not start any
/// background task itself; the caller (the server binary's `main`) spawns
/// [`SyncBridge::run`] and the Roster's periodic sweep with the returned
/// `cancel_token`.
pub fn bootstrap_services(config: &Config) -> BootstrappedServices {
    let storage: Arc<dyn StorageClient> =
        Arc::new(HttpStorageClient::new(config.storage_base_url.clone()));
    let bus_connector: Arc<dyn InvalidationBusConnector> =
        Arc::new(LapinConnector::new(config.rabbitmq_url.clone()));

    let write_back: Arc<dyn StorageWriter> = Arc::new(StorageWriteBackAdapter {
        storage: Arc::clone(&storage),
    });
    let roster = Arc::new(Roster::new(
        write_back,
        config.join_latency_budget,
        config.outbound_queue_max,
    ));

    let sync_bridge = SyncBridge::new(Arc::clone(&roster), Arc::clone(&storage), bus_connector);

    BootstrappedServices {
        roster,
        storage,
        sync_bridge,
        cancel_token: CancellationToken::new(),
    }
}
