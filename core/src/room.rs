//! Room: one instance per active playlist. Owns playback state, the device
//! roster, the queue snapshot, and the bound sockets, and interprets
//! commands per the protocol.
//!
//! All mutation of a Room's state happens under a single `parking_lot::Mutex`
//! (the "per-Room lock" option from the concurrency model); the lock is never
//! held across an `.await`. Fan-out to sockets is a non-blocking bounded
//! `mpsc` send per socket so one wedged peer cannot stall the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::model::{Device, DeviceMode, DeviceRole, PlaybackState, Song, SongStatus, now_ms};
use crate::protocol::{CommandAction, CommandPayload, CommandScope, ServerMessage, PROTOCOL_VERSION};
use crate::selector;

/// Narrow write-back interface Room calls into, implemented by the Sync
/// bridge. Breaks the Room <-> bridge cycle: Room never sees the bridge's
/// full type, only this trait (design notes, cyclic relationship).
#[async_trait]
pub trait StorageWriter: Send + Sync {
    async fn mark_song_played(&self, song_id: &str);
}

/// Narrow push interface the Sync bridge calls into, implemented by Room.
/// The bridge never sees Room's full type either.
pub trait UpdateQueueSink: Send + Sync {
    fn update_queue(&self, songs: Vec<Song>, epoch: u64);
}

/// Outcome of a successful [`Room::join`].
pub struct JoinOutcome {
    pub room_id: String,
    pub device_id: String,
    pub protocol_version: u32,
}

/// Per-socket outbound handle: a bounded channel the edge drains and writes
/// to the network. `try_send` never blocks; a full or closed channel is
/// treated as the socket having gone away (resource-error handling).
type OutboundSender = mpsc::Sender<ServerMessage>;

struct RoomState {
    name: String,
    devices: HashMap<String, Device>,
    sockets: HashMap<String, OutboundSender>,
    songs: Vec<Song>,
    playlist_epoch: u64,
    playback: PlaybackState,
    /// Set by `selectSong`; sticky until the next `selectSong` (see DESIGN.md
    /// for the Open Question this resolves).
    manual_mode: bool,
    /// When the last bound socket detached; `None` while the room has one.
    empty_since: Option<Instant>,
}

/// One active playlist's coordination context.
pub struct Room {
    pub id: String,
    pub playlist_key: String,
    state: Mutex<RoomState>,
    storage_writer: Arc<dyn StorageWriter>,
    join_latency_budget: Duration,
    outbound_queue_max: usize,
}

impl Room {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        playlist_key: impl Into<String>,
        storage_writer: Arc<dyn StorageWriter>,
        join_latency_budget: Duration,
        outbound_queue_max: usize,
    ) -> Self {
        Self {
            id: id.into(),
            playlist_key: playlist_key.into(),
            state: Mutex::new(RoomState {
                name: name.into(),
                devices: HashMap::new(),
                sockets: HashMap::new(),
                songs: Vec::new(),
                playlist_epoch: 0,
                playback: PlaybackState::default(),
                manual_mode: false,
                empty_since: Some(Instant::now()),
            }),
            storage_writer,
            join_latency_budget,
            outbound_queue_max,
        }
    }

    /// Number of currently bound sockets.
    pub fn socket_count(&self) -> usize {
        self.state.lock().sockets.len()
    }

    /// The room's display name (distinct from `id`/`playlist_key`).
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Whether the room has had zero bound sockets for at least `grace`.
    pub fn is_empty_for(&self, grace: Duration) -> bool {
        match self.state.lock().empty_since {
            Some(since) => since.elapsed() >= grace,
            None => false,
        }
    }

    fn negotiate_protocol_version(client_version: Option<u32>) -> CoordinatorResult<u32> {
        match client_version {
            None => Ok(PROTOCOL_VERSION),
            Some(v) if (1..=PROTOCOL_VERSION).contains(&v) => Ok(v),
            Some(v) => Err(CoordinatorError::UnsupportedProtocolVersion(v)),
        }
    }

    /// Registers/updates the device, attaches `sender` as its socket, and
    /// returns the negotiated protocol version. The caller (edge) is
    /// responsible for then writing `joinAck`, `state`, and `queue` to
    /// `sender` in that order; see module docs for why ordering is safe to
    /// split across direct sends and `broadcast_state`.
    pub fn join(
        &self,
        device_id: &str,
        name: &str,
        role: DeviceRole,
        client_protocol_version: Option<u32>,
        sender: OutboundSender,
    ) -> CoordinatorResult<JoinOutcome> {
        let protocol_version = Self::negotiate_protocol_version(client_protocol_version)?;

        let mut state = self.state.lock();
        match state.devices.get_mut(device_id) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.role = role;
                existing.touch();
            }
            None => {
                state
                    .devices
                    .insert(device_id.to_string(), Device::new(device_id, name, role));
            }
        }
        state.sockets.insert(device_id.to_string(), sender);
        state.empty_since = None;

        Ok(JoinOutcome {
            room_id: self.id.clone(),
            device_id: device_id.to_string(),
            protocol_version,
        })
    }

    /// The `state` frame for this room, for the caller to send directly to
    /// a just-joined socket (or any other caller that needs a one-off copy).
    pub fn state_message(&self) -> ServerMessage {
        let state = self.state.lock();
        Self::build_state_message(&state)
    }

    /// The `queue` frame for this room.
    pub fn queue_message(&self) -> ServerMessage {
        ServerMessage::Queue {
            songs: self.state.lock().songs.clone(),
        }
    }

    /// Detaches `device_id`'s socket. The Device record itself is retained
    /// (reconnect within the grace interval must not perturb the roster).
    pub fn leave(&self, device_id: &str) {
        let mut state = self.state.lock();
        state.sockets.remove(device_id);
        if state.sockets.is_empty() {
            state.empty_since.get_or_insert_with(Instant::now);
        }
    }

    pub fn set_role(&self, device_id: &str, role: DeviceRole) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| CoordinatorError::DeviceNotFound(device_id.to_string()))?;
        device.role = role;
        device.touch();
        let msg = Self::build_state_message(&state);
        Self::broadcast(&state, &msg);
        Ok(())
    }

    pub fn rename_device(&self, target_device_id: &str, name: &str) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(target_device_id)
            .ok_or_else(|| CoordinatorError::DeviceNotFound(target_device_id.to_string()))?;
        device.name = name.to_string();
        let msg = Self::build_state_message(&state);
        Self::broadcast(&state, &msg);
        Ok(())
    }

    /// Replies `pong{clientTime, serverTime}` to the originator only; does
    /// not mutate room state.
    pub fn handle_ping(&self, client_time: u64) -> ServerMessage {
        ServerMessage::Pong {
            client_time,
            server_time: now_ms(),
        }
    }

    /// Authoritative-player ground-truth report.
    ///
    /// Only the designated authoritative player's report mutates `playback`;
    /// reports from anyone else update liveness only (Open Question
    /// resolution, see DESIGN.md).
    pub fn handle_sync(
        &self,
        device_id: &str,
        current_song_id: Option<String>,
        is_playing: bool,
        current_time: f64,
        duration: f64,
    ) {
        let mut state = self.state.lock();
        if Self::authoritative_player_id(&state).as_deref() != Some(device_id) {
            if let Some(device) = state.devices.get_mut(device_id) {
                device.touch();
            }
            return;
        }

        state.playback.current_song_id = current_song_id;
        state.playback.is_playing = is_playing;
        state.playback.current_time = current_time.clamp(0.0, duration.max(0.0));
        state.playback.duration = duration;

        let msg = Self::build_state_message(&state);
        Self::broadcast(&state, &msg);
    }

    /// Invoked by the authoritative player on end-of-stream. A no-op (with a
    /// debug log) if called by anyone else.
    pub fn handle_song_ended(&self, device_id: &str) {
        {
            let state = self.state.lock();
            if Self::authoritative_player_id(&state).as_deref() != Some(device_id) {
                log::debug!(
                    "[Room {}] songEnded from non-authoritative device {}, ignoring",
                    self.id,
                    device_id
                );
                return;
            }
        }
        self.advance();
    }

    /// Replaces the queue snapshot and epoch (called by the Sync bridge),
    /// broadcasting `queue` to every bound socket. If the current song
    /// disappeared or degraded out of a playable status, advances as in the
    /// transition protocol.
    fn update_queue_inner(&self, songs: Vec<Song>, epoch: u64) {
        let needs_advance = {
            let mut state = self.state.lock();
            state.songs = songs;
            state.playlist_epoch = epoch;

            let msg = ServerMessage::Queue {
                songs: state.songs.clone(),
            };
            Self::broadcast(&state, &msg);

            match &state.playback.current_song_id {
                Some(id) => !state
                    .songs
                    .iter()
                    .any(|s| &s.id == id && matches!(s.status, SongStatus::Ready | SongStatus::Played)),
                None => false,
            }
        };

        if needs_advance {
            self.advance();
        }
    }

    pub fn handle_command(
        &self,
        from_device_id: &str,
        action: CommandAction,
        payload: Option<CommandPayload>,
        target_device_id: Option<String>,
    ) -> CoordinatorResult<()> {
        match action {
            CommandAction::Play
            | CommandAction::Pause
            | CommandAction::Toggle
            | CommandAction::Stop => {
                self.execute_transport(action, target_device_id.as_deref());
                Ok(())
            }
            CommandAction::Skip => {
                self.advance();
                Ok(())
            }
            CommandAction::Seek => {
                let time = payload
                    .as_ref()
                    .and_then(|p| p.get("time"))
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| CoordinatorError::Protocol("seek requires time".into()))?;
                self.seek(time);
                Ok(())
            }
            CommandAction::SetVolume => {
                let volume = payload
                    .as_ref()
                    .and_then(|p| p.get("volume"))
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| CoordinatorError::Protocol("setVolume requires volume".into()))?;
                self.set_volume(volume.clamp(0.0, 1.0), target_device_id.as_deref())
            }
            CommandAction::ToggleMute => {
                self.toggle_mute();
                Ok(())
            }
            CommandAction::Rate => {
                log::debug!(
                    "[Room {}] rate command from {} recorded for REST write-back",
                    self.id,
                    from_device_id
                );
                Ok(())
            }
            CommandAction::SelectSong => {
                let song_id = payload
                    .as_ref()
                    .and_then(|p| p.get("songId"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoordinatorError::Protocol("selectSong requires songId".into()))?;
                self.select_song(song_id)
            }
            CommandAction::ResetToDefault => {
                let target = target_device_id
                    .ok_or_else(|| CoordinatorError::Protocol("resetToDefault requires targetDeviceId".into()))?;
                self.reset_to_default(&target)
            }
            CommandAction::SyncAll => {
                self.sync_all();
                Ok(())
            }
        }
    }

    /// `play/pause/toggle/stop`: emits `execute` to the target device (if
    /// any) or every player; no direct mutation of `playback` (it is
    /// steered back in via the next authoritative `sync`).
    fn execute_transport(&self, action: CommandAction, target_device_id: Option<&str>) {
        let state = self.state.lock();
        let msg = ServerMessage::Execute {
            action,
            payload: None,
            scope: if target_device_id.is_some() {
                CommandScope::Device
            } else {
                CommandScope::Room
            },
        };
        match target_device_id {
            Some(target) => Self::send_one(&state, target, &msg),
            None => Self::broadcast_to_players(&state, &msg),
        }
    }

    fn seek(&self, time: f64) {
        let state = self.state.lock();
        let clamped = time.clamp(0.0, state.playback.duration.max(0.0));
        let msg = ServerMessage::Execute {
            action: CommandAction::Seek,
            payload: Some(serde_json::json!({ "time": clamped })),
            scope: CommandScope::Room,
        };
        Self::broadcast_to_players(&state, &msg);
    }

    /// Room scope clears every device's override and sets `playback.volume`.
    /// Device scope writes only the target's override and sends `execute`
    /// to that device alone -- no one else is notified (S4).
    fn set_volume(&self, volume: f64, target_device_id: Option<&str>) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        match target_device_id {
            Some(target) => {
                let device = state
                    .devices
                    .get_mut(target)
                    .ok_or_else(|| CoordinatorError::DeviceNotFound(target.to_string()))?;
                device.volume_override = Some(volume);
                device.mode = DeviceMode::Individual;
                let msg = ServerMessage::Execute {
                    action: CommandAction::SetVolume,
                    payload: Some(serde_json::json!({ "volume": volume })),
                    scope: CommandScope::Device,
                };
                Self::send_one(&state, target, &msg);
            }
            None => {
                for device in state.devices.values_mut() {
                    device.volume_override = None;
                    device.mode = DeviceMode::Default;
                }
                state.playback.volume = volume;
                let msg = Self::build_state_message(&state);
                Self::broadcast(&state, &msg);
            }
        }
        Ok(())
    }

    fn toggle_mute(&self) {
        let mut state = self.state.lock();
        state.playback.is_muted = !state.playback.is_muted;
        let msg = Self::build_state_message(&state);
        Self::broadcast(&state, &msg);
    }

    /// Jumps directly to `song_id` (bypassing the Selector); a no-op
    /// returning `SongNotPlayable` if the song isn't `ready` or `played`.
    fn select_song(&self, song_id: &str) -> CoordinatorResult<()> {
        let outgoing = {
            let mut state = self.state.lock();
            let song = state
                .songs
                .iter()
                .find(|s| s.id == song_id)
                .cloned()
                .ok_or_else(|| CoordinatorError::SongNotPlayable(song_id.to_string()))?;
            if !song.is_playable(true) {
                return Err(CoordinatorError::SongNotPlayable(song_id.to_string()));
            }

            let outgoing = state.playback.current_song_id.clone();
            state.manual_mode = true;
            self.apply_transition_locked(&mut state, Some(song));
            outgoing
        };

        if let Some(outgoing_id) = outgoing {
            self.spawn_mark_played(outgoing_id);
        }
        Ok(())
    }

    fn reset_to_default(&self, target_device_id: &str) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(target_device_id)
            .ok_or_else(|| CoordinatorError::DeviceNotFound(target_device_id.to_string()))?;
        device.volume_override = None;
        device.mode = DeviceMode::Default;
        let volume = state.playback.volume;
        let msg = ServerMessage::Execute {
            action: CommandAction::SetVolume,
            payload: Some(serde_json::json!({ "volume": volume })),
            scope: CommandScope::Device,
        };
        Self::send_one(&state, target_device_id, &msg);
        Ok(())
    }

    /// Re-emits room-scope `setVolume` and `play`/`pause` to every player.
    /// Per-device overrides are left latent, matching the source's behavior
    /// (see the Open Question resolution in DESIGN.md).
    fn sync_all(&self) {
        let state = self.state.lock();
        let volume_msg = ServerMessage::Execute {
            action: CommandAction::SetVolume,
            payload: Some(serde_json::json!({ "volume": state.playback.volume })),
            scope: CommandScope::Room,
        };
        let transport_action = if state.playback.is_playing {
            CommandAction::Play
        } else {
            CommandAction::Pause
        };
        let transport_msg = ServerMessage::Execute {
            action: transport_action,
            payload: None,
            scope: CommandScope::Room,
        };
        Self::broadcast_to_players(&state, &volume_msg);
        Self::broadcast_to_players(&state, &transport_msg);
    }

    /// The transition protocol: compute the Selector's candidate, mark the
    /// outgoing song played, advance `playback`, and fan out `nextSong` /
    /// `preload`.
    fn advance(&self) {
        let outgoing = {
            let mut state = self.state.lock();
            let current_order_index = state
                .playback
                .current_song_id
                .as_ref()
                .and_then(|id| state.songs.iter().find(|s| &s.id == id))
                .map(|s| s.order_index);

            let candidate = selector::pick_next(
                &state.songs,
                state.playback.current_song_id.as_deref(),
                state.playlist_epoch,
                current_order_index,
                state.manual_mode,
            );

            let outgoing = state.playback.current_song_id.clone();
            self.apply_transition_locked(&mut state, candidate);
            outgoing
        };

        if let Some(outgoing_id) = outgoing {
            self.spawn_mark_played(outgoing_id);
        }
    }

    /// Shared tail of `advance`/`select_song`: mutates `playback` to
    /// `candidate` (or idles), broadcasts/fans-out the resulting frames, and
    /// schedules the next-next `preload`. Must be called with `state` locked.
    fn apply_transition_locked(&self, state: &mut RoomState, candidate: Option<Song>) {
        match candidate {
            None => {
                state.playback.advance_to(None, 0.0);
                state.playback.is_playing = false;
                let msg = Self::build_state_message(state);
                Self::broadcast(state, &msg);
            }
            Some(song) => {
                let duration = song.metadata.duration.unwrap_or(0.0);
                state.playback.advance_to(Some(song.id.clone()), duration);
                state.playback.is_playing = true;

                let start_at = now_ms() + self.join_latency_budget.as_millis() as u64;
                let audio_url = song.metadata.audio_url.clone().unwrap_or_default();
                let next_msg = ServerMessage::NextSong {
                    song_id: song.id.clone(),
                    audio_url,
                    start_at: Some(start_at),
                };
                Self::broadcast_to_players(state, &next_msg);

                let next_next = selector::pick_next(
                    &state.songs,
                    Some(song.id.as_str()),
                    state.playlist_epoch,
                    Some(song.order_index),
                    state.manual_mode,
                );
                if let Some(preload_song) = next_next {
                    if matches!(preload_song.status, SongStatus::Ready) {
                        let preload_msg = ServerMessage::Preload {
                            song_id: preload_song.id.clone(),
                            audio_url: preload_song.metadata.audio_url.clone().unwrap_or_default(),
                        };
                        Self::broadcast_to_players(state, &preload_msg);
                    }
                }
            }
        }
    }

    fn spawn_mark_played(&self, song_id: String) {
        let writer = Arc::clone(&self.storage_writer);
        tokio::spawn(async move {
            writer.mark_song_played(&song_id).await;
        });
    }

    fn authoritative_player_id(state: &RoomState) -> Option<String> {
        state
            .sockets
            .keys()
            .filter_map(|id| state.devices.get(id))
            .filter(|d| d.role == DeviceRole::Player)
            .map(|d| d.id.clone())
            .min()
    }

    fn build_state_message(state: &RoomState) -> ServerMessage {
        let current_song = state
            .playback
            .current_song_id
            .as_ref()
            .and_then(|id| state.songs.iter().find(|s| &s.id == id))
            .cloned();
        ServerMessage::State {
            playback: state.playback.clone(),
            current_song,
            devices: state.devices.values().cloned().collect(),
            protocol_version: Some(PROTOCOL_VERSION),
        }
    }

    /// Sends to every bound socket, evicting any whose queue is full or closed.
    fn broadcast(state: &RoomState, msg: &ServerMessage) {
        for (device_id, _) in state.devices.iter() {
            Self::send_one(state, device_id, msg);
        }
    }

    /// Sends to every bound socket whose device role is `Player`.
    fn broadcast_to_players(state: &RoomState, msg: &ServerMessage) {
        for (device_id, device) in state.devices.iter() {
            if device.role == DeviceRole::Player {
                Self::send_one(state, device_id, msg);
            }
        }
    }

    /// Non-blocking send to a single device's socket, if bound. A full
    /// outbound queue is a resource error per the error-handling design;
    /// we log and drop rather than backpressure the Room's lane.
    fn send_one(state: &RoomState, device_id: &str, msg: &ServerMessage) {
        if let Some(sender) = state.sockets.get(device_id) {
            if let Err(e) = sender.try_send(msg.clone()) {
                log::warn!(
                    "[Room] outbound queue overflow or closed socket for device {}: {}",
                    device_id,
                    e
                );
            }
        }
    }
}

impl UpdateQueueSink for Room {
    fn update_queue(&self, songs: Vec<Song>, epoch: u64) {
        self.update_queue_inner(songs, epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SongMetadata;

    struct NoopWriter {
        marked: Mutex<Vec<String>>,
    }

    impl NoopWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                marked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StorageWriter for NoopWriter {
        async fn mark_song_played(&self, song_id: &str) {
            self.marked.lock().push(song_id.to_string());
        }
    }

    fn test_room(writer: Arc<NoopWriter>) -> Room {
        Room::new(
            "r1",
            "Test Room",
            "K1",
            writer,
            Duration::from_millis(150),
            16,
        )
    }

    fn song(id: &str, epoch: u64, order: f64, status: SongStatus, audio_url: &str) -> Song {
        Song {
            id: id.to_string(),
            creation_time: order as u64,
            order_index: order,
            status,
            is_interrupt: false,
            prompt_epoch: epoch,
            metadata: SongMetadata {
                audio_url: Some(audio_url.to_string()),
                duration: Some(180.0),
                ..Default::default()
            },
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// S1 — empty playlist: join yields an idle state + empty queue, and a
    /// `skip` on an empty queue produces no `nextSong`.
    #[tokio::test]
    async fn s1_empty_playlist_join_and_skip() {
        let room = test_room(NoopWriter::new());
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = room
            .join("p1", "Player", DeviceRole::Player, None, tx)
            .unwrap();
        assert_eq!(outcome.protocol_version, PROTOCOL_VERSION);

        match room.state_message() {
            ServerMessage::State {
                playback, devices, ..
            } => {
                assert!(playback.current_song_id.is_none());
                assert!(!playback.is_playing);
                assert_eq!(devices.len(), 1);
            }
            _ => panic!("expected State"),
        }
        match room.queue_message() {
            ServerMessage::Queue { songs } => assert!(songs.is_empty()),
            _ => panic!("expected Queue"),
        }

        room.handle_command("p1", CommandAction::Skip, None, None)
            .unwrap();
        let frames = drain(&mut rx);
        assert!(!frames
            .iter()
            .any(|f| matches!(f, ServerMessage::NextSong { .. })));
    }

    /// Authoritative player is the lexicographically smallest connected
    /// Player device id; a controller's `sync` never mutates playback.
    #[tokio::test]
    async fn authoritative_player_selection_and_liveness_only_sync() {
        let room = test_room(NoopWriter::new());
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(16);
        room.join("b-player", "B", DeviceRole::Player, None, tx_b)
            .unwrap();
        room.join("a-player", "A", DeviceRole::Player, None, tx_a)
            .unwrap();

        room.handle_sync("b-player", Some("x".into()), true, 1.0, 10.0);
        match room.state_message() {
            ServerMessage::State { playback, .. } => assert!(playback.current_song_id.is_none()),
            _ => panic!(),
        }

        room.handle_sync("a-player", Some("x".into()), true, 1.0, 10.0);
        match room.state_message() {
            ServerMessage::State { playback, .. } => {
                assert_eq!(playback.current_song_id.as_deref(), Some("x"))
            }
            _ => panic!(),
        }
    }

    /// S4 — device-scoped setVolume reaches only the target; the other
    /// player's socket receives nothing, and `playback.volume` is unchanged.
    #[tokio::test]
    async fn s4_device_scoped_volume_is_isolated() {
        let room = test_room(NoopWriter::new());
        let (tx_p1, mut rx_p1) = mpsc::channel(16);
        let (tx_p2, mut rx_p2) = mpsc::channel(16);
        room.join("p1", "P1", DeviceRole::Player, None, tx_p1)
            .unwrap();
        room.join("p2", "P2", DeviceRole::Player, None, tx_p2)
            .unwrap();
        drain(&mut rx_p1);
        drain(&mut rx_p2);

        room.handle_command(
            "controller",
            CommandAction::SetVolume,
            Some(serde_json::json!({ "volume": 0.5 })),
            Some("p1".to_string()),
        )
        .unwrap();

        let p1_frames = drain(&mut rx_p1);
        assert_eq!(p1_frames.len(), 1);
        assert!(matches!(
            &p1_frames[0],
            ServerMessage::Execute {
                scope: CommandScope::Device,
                ..
            }
        ));
        assert!(drain(&mut rx_p2).is_empty());

        match room.state_message() {
            ServerMessage::State { playback, .. } => assert_eq!(playback.volume, 1.0),
            _ => panic!(),
        }

        room.handle_command("controller", CommandAction::SyncAll, None, None)
            .unwrap();
        let p1_after_sync = drain(&mut rx_p1);
        let p2_after_sync = drain(&mut rx_p2);
        assert_eq!(p1_after_sync.len(), 2);
        assert_eq!(p2_after_sync.len(), 2);
    }

    /// S5 — reconnect with the same deviceId preserves the Device and
    /// playback state.
    #[tokio::test]
    async fn s5_reconnect_preserves_device_and_state() {
        let room = test_room(NoopWriter::new());
        let (tx1, _rx1) = mpsc::channel(16);
        room.join("p1", "Phone", DeviceRole::Player, None, tx1)
            .unwrap();
        room.handle_command(
            "p1",
            CommandAction::SetVolume,
            Some(serde_json::json!({ "volume": 0.2 })),
            None,
        )
        .unwrap();

        room.leave("p1");
        assert_eq!(room.socket_count(), 0);

        let (tx2, mut rx2) = mpsc::channel(16);
        room.join("p1", "Phone", DeviceRole::Player, None, tx2)
            .unwrap();
        assert_eq!(room.socket_count(), 1);

        match room.state_message() {
            ServerMessage::State {
                playback, devices, ..
            } => {
                assert_eq!(playback.volume, 0.2);
                assert_eq!(devices.len(), 1);
            }
            _ => panic!(),
        }
        // fresh state/queue would be sent by the edge layer on rejoin; here
        // we just assert the channel is alive and usable.
        assert!(rx2.try_recv().is_err());
    }

    /// S6 — invalidation-driven queue refresh reaches every bound socket
    /// exactly once.
    #[tokio::test]
    async fn s6_queue_refresh_reaches_every_socket_once() {
        let room = test_room(NoopWriter::new());
        let (tx1, mut rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        room.join("p1", "P1", DeviceRole::Player, None, tx1)
            .unwrap();
        room.join("c1", "C1", DeviceRole::Controller, None, tx2)
            .unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        room.update_queue(
            vec![song("a", 1, 1.0, SongStatus::Ready, "https://a")],
            1,
        );

        let f1 = drain(&mut rx1);
        let f2 = drain(&mut rx2);
        assert_eq!(f1.len(), 1);
        assert_eq!(f2.len(), 1);
        assert!(matches!(f1[0], ServerMessage::Queue { .. }));
    }

    /// EOS advance marks the outgoing song played exactly once and, when a
    /// next-next `ready` candidate exists, follows `nextSong` with exactly
    /// one `preload`.
    #[tokio::test]
    async fn eos_advance_marks_played_and_preloads_next_next() {
        let writer = NoopWriter::new();
        let room = test_room(Arc::clone(&writer));
        let (tx, mut rx) = mpsc::channel(16);
        room.join("p1", "P1", DeviceRole::Player, None, tx)
            .unwrap();
        drain(&mut rx);

        room.update_queue(
            vec![
                song("a", 1, 1.0, SongStatus::Ready, "https://a"),
                song("b", 1, 2.0, SongStatus::Ready, "https://b"),
                song("c", 1, 3.0, SongStatus::Ready, "https://c"),
            ],
            1,
        );
        drain(&mut rx);

        room.handle_sync("p1", Some("a".into()), true, 0.0, 180.0);
        drain(&mut rx);

        room.handle_song_ended("p1");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let frames = drain(&mut rx);
        let next_song = frames
            .iter()
            .find(|f| matches!(f, ServerMessage::NextSong { .. }))
            .unwrap();
        match next_song {
            ServerMessage::NextSong { song_id, .. } => assert_eq!(song_id, "b"),
            _ => unreachable!(),
        }
        let preload = frames
            .iter()
            .find(|f| matches!(f, ServerMessage::Preload { .. }))
            .unwrap();
        match preload {
            ServerMessage::Preload { song_id, .. } => assert_eq!(song_id, "c"),
            _ => unreachable!(),
        }

        assert_eq!(writer.marked.lock().as_slice(), &["a".to_string()]);
    }

    #[tokio::test]
    async fn select_song_rejects_unplayable_target() {
        let room = test_room(NoopWriter::new());
        room.update_queue(
            vec![song("a", 1, 1.0, SongStatus::GeneratingAudio, "https://a")],
            1,
        );
        let err = room
            .handle_command(
                "p1",
                CommandAction::SelectSong,
                Some(serde_json::json!({ "songId": "a" })),
                None,
            )
            .unwrap_err();
        assert_eq!(err.code(), "song_not_playable");
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let room_a = test_room(NoopWriter::new());
        let room_b = test_room(NoopWriter::new());
        let (tx_a, _rx_a) = mpsc::channel(16);
        room_a
            .join("p1", "P1", DeviceRole::Player, None, tx_a)
            .unwrap();

        room_a.update_queue(vec![song("x", 1, 1.0, SongStatus::Ready, "https://x")], 1);

        match room_b.queue_message() {
            ServerMessage::Queue { songs } => assert!(songs.is_empty()),
            _ => panic!(),
        }
        assert_eq!(room_b.socket_count(), 0);
    }
}
