//! Roster: the dual-indexed registry of live Rooms.
//!
//! Looked up by `roomId` (one Room) and by `playlistKey` (every Room bound to
//! that key, since several rooms can share a playlist). The Roster's own lock
//! is held only long enough to read or mutate the index maps themselves --
//! never across a Room operation, which has its own lock (concurrency model).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::room::{Room, StorageWriter};

struct RosterIndex {
    rooms: HashMap<String, Arc<Room>>,
    /// playlistKey -> roomIds bound to it. A room is removed from here the
    /// instant it's removed from `rooms`.
    by_playlist_key: HashMap<String, Vec<String>>,
}

/// The registry of live Rooms, keyed by room id and playlist key.
pub struct Roster {
    index: RwLock<RosterIndex>,
    storage_writer: Arc<dyn StorageWriter>,
    join_latency_budget: Duration,
    outbound_queue_max: usize,
}

impl Roster {
    pub fn new(
        storage_writer: Arc<dyn StorageWriter>,
        join_latency_budget: Duration,
        outbound_queue_max: usize,
    ) -> Self {
        Self {
            index: RwLock::new(RosterIndex {
                rooms: HashMap::new(),
                by_playlist_key: HashMap::new(),
            }),
            storage_writer,
            join_latency_budget,
            outbound_queue_max,
        }
    }

    /// Returns the Room for `room_id`, creating it with `playlist_key`/`name`
    /// if it doesn't exist yet. Idempotent: a second call with the same
    /// `room_id` returns the existing Room untouched, even if `playlist_key`
    /// or `name` differ (the first caller wins).
    pub fn create_room(&self, room_id: &str, playlist_key: &str, name: &str) -> Arc<Room> {
        {
            let index = self.index.read();
            if let Some(room) = index.rooms.get(room_id) {
                return Arc::clone(room);
            }
        }

        let mut index = self.index.write();
        if let Some(room) = index.rooms.get(room_id) {
            return Arc::clone(room);
        }

        let room = Arc::new(Room::new(
            room_id,
            name,
            playlist_key,
            Arc::clone(&self.storage_writer),
            self.join_latency_budget,
            self.outbound_queue_max,
        ));
        index.rooms.insert(room_id.to_string(), Arc::clone(&room));
        index
            .by_playlist_key
            .entry(playlist_key.to_string())
            .or_default()
            .push(room_id.to_string());

        log::info!("[Roster] created room {} for playlist key {}", room_id, playlist_key);
        room
    }

    pub fn get_room(&self, room_id: &str) -> CoordinatorResult<Arc<Room>> {
        self.index
            .read()
            .rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))
    }

    /// Every Room currently bound to `playlist_key` (usually zero or one,
    /// but several rooms may legitimately share a key).
    pub fn get_rooms_by_playlist_key(&self, playlist_key: &str) -> Vec<Arc<Room>> {
        let index = self.index.read();
        index
            .by_playlist_key
            .get(playlist_key)
            .into_iter()
            .flatten()
            .filter_map(|id| index.rooms.get(id).cloned())
            .collect()
    }

    pub fn list_rooms(&self) -> Vec<Arc<Room>> {
        self.index.read().rooms.values().cloned().collect()
    }

    /// Removes `room_id` from both indexes. Returns whether a room was
    /// actually removed, so callers (the REST `DELETE` handler) can report
    /// `404` on an already-absent id instead of treating it as success.
    pub fn remove_room(&self, room_id: &str) -> bool {
        let mut index = self.index.write();
        if let Some(room) = index.rooms.remove(room_id) {
            if let Some(ids) = index.by_playlist_key.get_mut(&room.playlist_key) {
                ids.retain(|id| id != room_id);
                if ids.is_empty() {
                    index.by_playlist_key.remove(&room.playlist_key);
                }
            }
            log::info!("[Roster] removed room {}", room_id);
            true
        } else {
            false
        }
    }

    /// Sweeps and removes every Room that has had zero bound sockets for at
    /// least `grace`. Called on a periodic timer by the server's bootstrap
    /// loop; returns the ids removed, for logging.
    pub fn sweep_empty_rooms(&self, grace: Duration) -> Vec<String> {
        let candidates: Vec<String> = {
            let index = self.index.read();
            index
                .rooms
                .iter()
                .filter(|(_, room)| room.is_empty_for(grace))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &candidates {
            self.remove_room(id);
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopWriter;

    #[async_trait]
    impl StorageWriter for NoopWriter {
        async fn mark_song_played(&self, _song_id: &str) {}
    }

    fn roster() -> Roster {
        Roster::new(Arc::new(NoopWriter), Duration::from_millis(150), 16)
    }

    #[test]
    fn create_room_is_idempotent() {
        let roster = roster();
        let a = roster.create_room("r1", "K1", "Room One");
        let b = roster.create_room("r1", "K1", "Room One (dup)");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(roster.list_rooms().len(), 1);
    }

    #[test]
    fn lookup_by_playlist_key_finds_all_bound_rooms() {
        let roster = roster();
        roster.create_room("r1", "K1", "A");
        roster.create_room("r2", "K1", "B");
        roster.create_room("r3", "K2", "C");

        let bound = roster.get_rooms_by_playlist_key("K1");
        assert_eq!(bound.len(), 2);
        assert!(roster.get_rooms_by_playlist_key("K-missing").is_empty());
    }

    #[test]
    fn get_room_errors_when_missing() {
        let roster = roster();
        let err = roster.get_room("missing").unwrap_err();
        assert_eq!(err.code(), "room_not_found");
    }

    #[test]
    fn remove_room_clears_both_indexes() {
        let roster = roster();
        roster.create_room("r1", "K1", "A");
        roster.remove_room("r1");
        assert!(roster.get_room("r1").is_err());
        assert!(roster.get_rooms_by_playlist_key("K1").is_empty());
    }

    #[test]
    fn sweep_only_removes_rooms_empty_past_grace() {
        let roster = roster();
        let room = roster.create_room("r1", "K1", "A");
        // freshly created rooms start "empty since now", so a zero grace
        // period should sweep it immediately.
        let swept = roster.sweep_empty_rooms(Duration::from_secs(0));
        assert_eq!(swept, vec!["r1".to_string()]);
        drop(room);
        assert!(roster.get_room("r1").is_err());
    }
}
