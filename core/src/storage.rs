//! The storage interface: the narrow query surface the coordinator consumes
//! from the owning playlist/song/device store, and the write-back path used
//! to mark a song `played`.
//!
//! This is deliberately a trait, not a concrete HTTP client type: the Sync
//! bridge and Room only ever depend on [`StorageClient`], so tests can swap
//! in [`InMemoryStorageClient`] without a network.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::model::Song;

/// A playlist row as returned by the storage layer.
///
/// `prompt_epoch` feeds `Room::playlist_epoch`; the Selector prefers songs
/// whose `prompt_epoch` matches it.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistRecord {
    pub id: String,
    pub prompt_epoch: u64,
    pub name: String,
}

/// The operations the coordinator requires from the storage layer (external
/// interfaces, storage section). Implementations are expected to apply their
/// own request deadline; a timeout should surface as [`CoordinatorError::Storage`]
/// so the caller logs and skips rather than blocking a Room's lane.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn get_playlist_by_key(&self, key: &str) -> CoordinatorResult<Option<PlaylistRecord>>;
    async fn get_playlist(&self, id: &str) -> CoordinatorResult<Option<PlaylistRecord>>;
    async fn get_song_queue(&self, playlist_id: &str) -> CoordinatorResult<Vec<Song>>;
    async fn update_song_status(&self, song_id: &str, status: &str) -> CoordinatorResult<()>;
}

/// HTTP-backed [`StorageClient`] for the production deployment.
///
/// Talks to the owning storage service's REST surface over `reqwest`, the
/// same client type used elsewhere in this codebase for outbound HTTP calls.
pub struct HttpStorageClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStorageClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl StorageClient for HttpStorageClient {
    async fn get_playlist_by_key(&self, key: &str) -> CoordinatorResult<Option<PlaylistRecord>> {
        let resp = self
            .http
            .get(self.url(&format!("/playlists/by-key/{key}")))
            .send()
            .await
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = resp
            .error_for_status()
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?;
        Ok(Some(record))
    }

    async fn get_playlist(&self, id: &str) -> CoordinatorResult<Option<PlaylistRecord>> {
        let resp = self
            .http
            .get(self.url(&format!("/playlists/{id}")))
            .send()
            .await
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = resp
            .error_for_status()
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?;
        Ok(Some(record))
    }

    async fn get_song_queue(&self, playlist_id: &str) -> CoordinatorResult<Vec<Song>> {
        self.http
            .get(self.url(&format!("/playlists/{playlist_id}/songs")))
            .send()
            .await
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoordinatorError::Storage(e.to_string()))
    }

    async fn update_song_status(&self, song_id: &str, status: &str) -> CoordinatorResult<()> {
        self.http
            .patch(self.url(&format!("/songs/{song_id}")))
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoordinatorError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// In-memory [`StorageClient`] used by integration tests driving a
/// [`crate::room::Room`] or [`crate::sync_bridge::SyncBridge`] without a
/// network, mirroring the fixture pattern the rest of this codebase uses
/// for its service-layer tests.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct InMemoryStorageClient {
        playlists_by_key: Mutex<HashMap<String, PlaylistRecord>>,
        playlists_by_id: Mutex<HashMap<String, PlaylistRecord>>,
        queues: Mutex<HashMap<String, Vec<Song>>>,
        pub updated_statuses: Mutex<Vec<(String, String)>>,
    }

    impl InMemoryStorageClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed_playlist(&self, key: &str, record: PlaylistRecord) {
            self.playlists_by_key
                .lock()
                .insert(key.to_string(), record.clone());
            self.playlists_by_id.lock().insert(record.id.clone(), record);
        }

        pub fn seed_queue(&self, playlist_id: &str, songs: Vec<Song>) {
            self.queues.lock().insert(playlist_id.to_string(), songs);
        }
    }

    #[async_trait]
    impl StorageClient for InMemoryStorageClient {
        async fn get_playlist_by_key(
            &self,
            key: &str,
        ) -> CoordinatorResult<Option<PlaylistRecord>> {
            Ok(self.playlists_by_key.lock().get(key).cloned())
        }

        async fn get_playlist(&self, id: &str) -> CoordinatorResult<Option<PlaylistRecord>> {
            Ok(self.playlists_by_id.lock().get(id).cloned())
        }

        async fn get_song_queue(&self, playlist_id: &str) -> CoordinatorResult<Vec<Song>> {
            Ok(self.queues.lock().get(playlist_id).cloned().unwrap_or_default())
        }

        async fn update_song_status(&self, song_id: &str, status: &str) -> CoordinatorResult<()> {
            self.updated_statuses
                .lock()
                .push((song_id.to_string(), status.to_string()));
            Ok(())
        }
    }
}
