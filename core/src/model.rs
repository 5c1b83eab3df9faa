//! Core data model: devices, playback state, and song queue entries.
//!
//! These are the plain data types a [`crate::room::Room`] owns and mutates.
//! None of them carry behavior beyond small accessors; the state machine
//! lives in `room.rs`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The role a connected [`Device`] plays in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceRole {
    /// An audio-rendering endpoint; exactly one `Player` is authoritative.
    Player,
    /// A remote control with no playback-state reporting rights.
    Controller,
}

/// Whether a device follows the room volume or its own override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceMode {
    /// Follows `playback.volume`.
    Default,
    /// Follows `volume_override`, set by a device-scoped `setVolume`.
    Individual,
}

/// One connected endpoint in a room.
///
/// Identity (`id`) is chosen by the client and is stable across reconnects;
/// `join`/`leave` attach and detach a socket without destroying the Device
/// record itself (see [`crate::room::Room::leave`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub role: DeviceRole,
    #[serde(default)]
    pub mode: DeviceMode,
    /// Per-device volume override in `[0, 1]`; `None` means "follow room volume".
    pub volume_override: Option<f64>,
    /// Unix millis of last activity (join, command, ping, or reconnect).
    pub last_seen_ms: u64,
}

impl Default for DeviceMode {
    fn default() -> Self {
        DeviceMode::Default
    }
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: DeviceRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            mode: DeviceMode::Default,
            volume_override: None,
            last_seen_ms: now_ms(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen_ms = now_ms();
    }
}

/// Milliseconds since the Unix epoch, used for `last_seen_ms` bookkeeping.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle status of a song record in the queue snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SongStatus {
    Pending,
    GeneratingMetadata,
    MetadataReady,
    SubmittingToAce,
    GeneratingAudio,
    Saving,
    Ready,
    Played,
    RetryPending,
    Error,
}

impl SongStatus {
    /// True for statuses the Selector considers generating / in-flight.
    ///
    /// Used to find the oldest in-flight interrupt for the "next up" banner
    /// (`find_generating_interrupt`).
    pub fn is_generating(self) -> bool {
        matches!(
            self,
            SongStatus::Pending
                | SongStatus::GeneratingMetadata
                | SongStatus::MetadataReady
                | SongStatus::SubmittingToAce
                | SongStatus::GeneratingAudio
                | SongStatus::Saving
        )
    }
}

/// Denormalized song metadata, present once generation has produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SongMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lyrics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
}

/// One entry in a Room's queue snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    /// Monotonic within a playlist; used as the P1 interrupt tie-break.
    pub creation_time: u64,
    /// Floating-point so midpoint reordering (`(a + b) / 2`) works.
    pub order_index: f64,
    pub status: SongStatus,
    #[serde(default)]
    pub is_interrupt: bool,
    pub prompt_epoch: u64,
    #[serde(flatten)]
    pub metadata: SongMetadata,
}

impl Song {
    /// Whether this song can become `currentSongId` under the given mode.
    ///
    /// `manual_mode` additionally admits songs already marked `played`,
    /// per the Selector's playable-set rule.
    pub fn is_playable(&self, manual_mode: bool) -> bool {
        match self.status {
            SongStatus::Ready => true,
            SongStatus::Played => manual_mode,
            _ => false,
        }
    }
}

/// The authoritative per-room playback tuple.
///
/// Invariants (enforced by [`crate::room::Room`], not by this struct alone):
/// `0 <= current_time <= duration`; `current_song_id == None` implies
/// `current_time == 0.0 && duration == 0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub current_song_id: Option<String>,
    pub is_playing: bool,
    pub current_time: f64,
    pub duration: f64,
    pub volume: f64,
    pub is_muted: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            current_song_id: None,
            is_playing: false,
            current_time: 0.0,
            duration: 0.0,
            volume: 1.0,
            is_muted: false,
        }
    }
}

impl PlaybackState {
    /// Resets timing fields for a transition to `song_id` (or to idle when `None`).
    pub fn advance_to(&mut self, song_id: Option<String>, duration: f64) {
        self.current_song_id = song_id;
        self.current_time = 0.0;
        self.duration = if self.current_song_id.is_some() {
            duration
        } else {
            0.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn song_is_playable_ready_always() {
        let mut song = make_song("a", SongStatus::Ready);
        assert!(song.is_playable(false));
        assert!(song.is_playable(true));
        song.status = SongStatus::Played;
        assert!(!song.is_playable(false));
        assert!(song.is_playable(true));
    }

    #[test]
    fn song_is_playable_excludes_generating_statuses() {
        let song = make_song("a", SongStatus::GeneratingAudio);
        assert!(!song.is_playable(false));
        assert!(!song.is_playable(true));
    }

    #[test]
    fn playback_advance_to_resets_timing() {
        let mut playback = PlaybackState {
            current_time: 42.0,
            duration: 100.0,
            ..Default::default()
        };
        playback.advance_to(Some("next".into()), 180.0);
        assert_eq!(playback.current_time, 0.0);
        assert_eq!(playback.duration, 180.0);

        playback.advance_to(None, 0.0);
        assert_eq!(playback.current_time, 0.0);
        assert_eq!(playback.duration, 0.0);
    }

    fn make_song(id: &str, status: SongStatus) -> Song {
        Song {
            id: id.to_string(),
            creation_time: 0,
            order_index: 0.0,
            status,
            is_interrupt: false,
            prompt_epoch: 0,
            metadata: SongMetadata::default(),
        }
    }
}
