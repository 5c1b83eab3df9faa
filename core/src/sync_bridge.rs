//! The Sync bridge: the background worker that keeps Room queue snapshots in
//! step with the owning storage service via the invalidation bus.
//!
//! Holds the playlist key<->id write-through cache (resolving a client's
//! `playlistKey` to the canonical `playlistId` the bus's routing keys and
//! [`crate::roster::Roster`]'s index use) and implements [`StorageWriter`],
//! the narrow trait [`crate::room::Room`] calls into to mark a song played --
//! this is the other half of the cycle-breaking pair described in the design
//! notes ([`crate::room::UpdateQueueSink`] is the half Room implements).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::{reconnect_backoff, InvalidationBus, InvalidationBusConnector};
use crate::error::CoordinatorResult;
use crate::room::{StorageWriter, UpdateQueueSink};
use crate::roster::Roster;
use crate::storage::{PlaylistRecord, StorageClient};

#[derive(Default)]
struct PlaylistKeyCache {
    by_key: HashMap<String, PlaylistRecord>,
    by_id: HashMap<String, PlaylistRecord>,
}

impl PlaylistKeyCache {
    fn insert(&mut self, key: Option<&str>, record: PlaylistRecord) {
        if let Some(key) = key {
            self.by_key.insert(key.to_string(), record.clone());
        }
        self.by_id.insert(record.id.clone(), record);
    }

    fn invalidate_all(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
    }
}

pub struct SyncBridge {
    roster: Arc<Roster>,
    storage: Arc<dyn StorageClient>,
    connector: Arc<dyn InvalidationBusConnector>,
    cache: RwLock<PlaylistKeyCache>,
}

impl SyncBridge {
    pub fn new(
        roster: Arc<Roster>,
        storage: Arc<dyn StorageClient>,
        connector: Arc<dyn InvalidationBusConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            roster,
            storage,
            connector,
            cache: RwLock::new(PlaylistKeyCache::default()),
        })
    }

    /// Resolves a `playlistKey` to its canonical record, querying the storage
    /// layer on a cache miss and caching both the key- and id-keyed entry.
    pub async fn resolve_by_key(&self, key: &str) -> CoordinatorResult<Option<PlaylistRecord>> {
        if let Some(record) = self.cache.read().by_key.get(key).cloned() {
            return Ok(Some(record));
        }
        let record = self.storage.get_playlist_by_key(key).await?;
        if let Some(record) = &record {
            self.cache.write().insert(Some(key), record.clone());
        }
        Ok(record)
    }

    /// Resolves a `playlistId` directly, same caching behavior.
    pub async fn resolve_by_id(&self, id: &str) -> CoordinatorResult<Option<PlaylistRecord>> {
        if let Some(record) = self.cache.read().by_id.get(id).cloned() {
            return Ok(Some(record));
        }
        let record = self.storage.get_playlist(id).await?;
        if let Some(record) = &record {
            self.cache.write().insert(None, record.clone());
        }
        Ok(record)
    }

    /// Runs the reconnect-and-consume loop until `shutdown` fires. Each
    /// connection failure is retried with [`reconnect_backoff`]; the attempt
    /// counter resets after any successfully consumed event.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut attempt = 0u32;
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let mut bus = match self.connector.connect().await {
                Ok(bus) => {
                    attempt = 0;
                    bus
                }
                Err(e) => {
                    let delay = reconnect_backoff(attempt);
                    log::warn!(
                        "[SyncBridge] connect failed ({}), retrying in {:?}",
                        e,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.cancelled() => return,
                    }
                }
            };

            loop {
                let event = tokio::select! {
                    event = bus.next_event() => event,
                    _ = shutdown.cancelled() => return,
                };

                match event {
                    Ok(event) => {
                        attempt = 0;
                        self.handle_event(&event.routing_key).await;
                    }
                    Err(e) => {
                        log::warn!("[SyncBridge] lost bus connection: {}", e);
                        break;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, routing_key: &str) {
        if routing_key == "settings" {
            return;
        }
        if routing_key == "playlists" {
            self.cache.write().invalidate_all();
            return;
        }
        if let Some(playlist_id) = routing_key.strip_prefix("songs.") {
            self.refresh_queue(playlist_id).await;
        }
    }

    /// Fetches the current song queue for `playlist_id` and pushes it into
    /// every Room bound to it.
    async fn refresh_queue(&self, playlist_id: &str) {
        let record = match self.resolve_by_id(playlist_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::warn!("[SyncBridge] songs event for unknown playlist {}", playlist_id);
                return;
            }
            Err(e) => {
                log::warn!("[SyncBridge] failed to resolve playlist {}: {}", playlist_id, e);
                return;
            }
        };

        let songs = match self.storage.get_song_queue(playlist_id).await {
            Ok(songs) => songs,
            Err(e) => {
                log::warn!("[SyncBridge] failed to fetch queue for {}: {}", playlist_id, e);
                return;
            }
        };

        let rooms = self.roster.get_rooms_by_playlist_key(playlist_id);
        for room in rooms {
            room.update_queue(songs.clone(), record.prompt_epoch);
        }
    }
}

#[async_trait]
impl StorageWriter for SyncBridge {
    async fn mark_song_played(&self, song_id: &str) {
        if let Err(e) = self.storage.update_song_status(song_id, "played").await {
            log::warn!("[SyncBridge] failed to mark {} played: {}", song_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Song, SongMetadata, SongStatus};
    use crate::storage::test_support::InMemoryStorageClient;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NeverConnects;
    #[async_trait]
    impl InvalidationBusConnector for NeverConnects {
        async fn connect(&self) -> CoordinatorResult<Box<dyn InvalidationBus>> {
            Err(crate::error::CoordinatorError::Bus("no broker in test".into()))
        }
    }

    fn song(id: &str, epoch: u64, order: f64) -> Song {
        Song {
            id: id.to_string(),
            creation_time: order as u64,
            order_index: order,
            status: SongStatus::Ready,
            is_interrupt: false,
            prompt_epoch: epoch,
            metadata: SongMetadata {
                audio_url: Some(format!("https://audio/{id}")),
                duration: Some(180.0),
                ..Default::default()
            },
        }
    }

    fn bridge_and_roster() -> (Arc<SyncBridge>, Arc<Roster>) {
        let storage = Arc::new(InMemoryStorageClient::new());
        let roster = Arc::new(Roster::new(
            Arc::new(NoopWriter),
            Duration::from_millis(150),
            16,
        ));
        let bridge = SyncBridge::new(
            Arc::clone(&roster),
            storage.clone() as Arc<dyn StorageClient>,
            Arc::new(NeverConnects),
        );
        (bridge, roster)
    }

    struct NoopWriter;
    #[async_trait]
    impl StorageWriter for NoopWriter {
        async fn mark_song_played(&self, _song_id: &str) {}
    }

    /// S6 — a `songs.<playlistId>` event refreshes every Room bound to that
    /// playlist's resolved id.
    #[tokio::test]
    async fn s6_songs_event_refreshes_bound_rooms() {
        let storage = Arc::new(InMemoryStorageClient::new());
        storage.seed_playlist(
            "playlist-1",
            PlaylistRecord {
                id: "playlist-1".into(),
                prompt_epoch: 2,
                name: "Room One".into(),
            },
        );
        storage.seed_queue("playlist-1", vec![song("a", 2, 1.0)]);

        let roster = Arc::new(Roster::new(Arc::new(NoopWriter), Duration::from_millis(150), 16));
        let bridge = SyncBridge::new(
            Arc::clone(&roster),
            storage.clone() as Arc<dyn StorageClient>,
            Arc::new(NeverConnects),
        );

        let room = roster.create_room("r1", "playlist-1", "Room One");
        let (tx, mut rx) = mpsc::channel(16);
        room.join("p1", "P1", crate::model::DeviceRole::Player, None, tx)
            .unwrap();
        while rx.try_recv().is_ok() {}

        bridge.handle_event("songs.playlist-1").await;

        match room.queue_message() {
            crate::protocol::ServerMessage::Queue { songs } => {
                assert_eq!(songs.len(), 1);
                assert_eq!(songs[0].id, "a");
            }
            _ => panic!("expected Queue"),
        }
        assert!(rx.try_recv().is_ok(), "joined socket should see the refreshed queue");
    }

    #[tokio::test]
    async fn playlists_event_clears_the_cache() {
        let (bridge, _roster) = bridge_and_roster();
        {
            let mut cache = bridge.cache.write();
            cache.insert(
                Some("k1"),
                PlaylistRecord {
                    id: "p1".into(),
                    prompt_epoch: 0,
                    name: "X".into(),
                },
            );
        }
        bridge.handle_event("playlists").await;
        assert!(bridge.cache.read().by_key.is_empty());
    }

    #[tokio::test]
    async fn mark_song_played_swallows_storage_errors() {
        struct FailingWriter;
        #[async_trait]
        impl StorageClient for FailingWriter {
            async fn get_playlist_by_key(
                &self,
                _key: &str,
            ) -> CoordinatorResult<Option<PlaylistRecord>> {
                Ok(None)
            }
            async fn get_playlist(&self, _id: &str) -> CoordinatorResult<Option<PlaylistRecord>> {
                Ok(None)
            }
            async fn get_song_queue(&self, _playlist_id: &str) -> CoordinatorResult<Vec<Song>> {
                Ok(Vec::new())
            }
            async fn update_song_status(
                &self,
                _song_id: &str,
                _status: &str,
            ) -> CoordinatorResult<()> {
                Err(crate::error::CoordinatorError::Storage("down".into()))
            }
        }

        let roster = Arc::new(Roster::new(Arc::new(NoopWriter), Duration::from_millis(150), 16));
        let bridge = SyncBridge::new(roster, Arc::new(FailingWriter), Arc::new(NeverConnects));
        // must not panic
        bridge.mark_song_played("s1").await;
    }
}
