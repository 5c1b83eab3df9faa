//! WebSocket wire protocol: the framed messages exchanged between clients
//! and a Room via the edge.
//!
//! One UTF-8 JSON object per message, tagged on `"type"`. The server's
//! native protocol version is [`PROTOCOL_VERSION`]; see
//! [`crate::room::Room::negotiate_protocol_version`] for the compatibility
//! rule clients rely on.

use serde::{Deserialize, Serialize};

use crate::model::{Device, DeviceRole, PlaybackState, Song};

/// The server's native WebSocket protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// A command action understood by [`crate::room::Room::handle_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandAction {
    Play,
    Pause,
    Stop,
    Toggle,
    Skip,
    Seek,
    SetVolume,
    ToggleMute,
    Rate,
    SelectSong,
    ResetToDefault,
    SyncAll,
}

/// Whether a command or `execute` frame applies to the whole room or a
/// single targeted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandScope {
    Room,
    Device,
}

/// `up` or `down`, the payload of a `rate` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Rating {
    Up,
    Down,
}

/// Freeform payload carried by `command` and `execute` frames.
///
/// Kept as an untyped JSON value because the payload shape varies by
/// [`CommandAction`] (a `seek` payload is `{time}`, a `setVolume` payload is
/// `{volume}`, `rate` is `{songId, rating}`, and several actions carry none).
pub type CommandPayload = serde_json::Value;

/// Messages a client sends to the edge.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Join {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        playlist_id: Option<String>,
        device_id: String,
        device_name: String,
        role: DeviceRole,
        #[serde(default)]
        playlist_key: Option<String>,
        #[serde(default)]
        room_name: Option<String>,
        #[serde(default)]
        protocol_version: Option<u32>,
    },
    Command {
        action: CommandAction,
        #[serde(default)]
        payload: Option<CommandPayload>,
        #[serde(default)]
        target_device_id: Option<String>,
    },
    Sync {
        current_song_id: Option<String>,
        is_playing: bool,
        current_time: f64,
        duration: f64,
    },
    SetRole {
        role: DeviceRole,
    },
    SongEnded {},
    RenameDevice {
        target_device_id: String,
        name: String,
    },
    Ping {
        client_time: u64,
    },
}

/// Messages the edge sends to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    JoinAck {
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        playlist_id: Option<String>,
        device_id: String,
        protocol_version: u32,
    },
    State {
        playback: PlaybackState,
        current_song: Option<Song>,
        devices: Vec<Device>,
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol_version: Option<u32>,
    },
    Queue {
        songs: Vec<Song>,
    },
    Execute {
        action: CommandAction,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<CommandPayload>,
        scope: CommandScope,
    },
    NextSong {
        song_id: String,
        audio_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_at: Option<u64>,
    },
    Preload {
        song_id: String,
        audio_url: String,
    },
    Pong {
        client_time: u64,
        server_time: u64,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Serializes this frame to a single JSON line, the unit the edge writes
    /// to a socket's outbound queue.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"failed to encode frame: {e}"}}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_join_tag_matches_protocol_table() {
        let raw = r#"{"type":"join","deviceId":"d1","deviceName":"Phone","role":"player"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::Join { .. }));
    }

    #[test]
    fn server_next_song_serializes_camel_case_tag() {
        let msg = ServerMessage::NextSong {
            song_id: "s1".into(),
            audio_url: "https://example.com/s1.mp3".into(),
            start_at: Some(1000),
        };
        let json = msg.to_json();
        assert!(json.contains(r#""type":"nextSong""#));
        assert!(json.contains(r#""songId":"s1""#));
    }

    #[test]
    fn server_error_omits_optional_fields_cleanly() {
        let msg = ServerMessage::JoinAck {
            room_id: "r1".into(),
            playlist_id: None,
            device_id: "d1".into(),
            protocol_version: PROTOCOL_VERSION,
        };
        let json = msg.to_json();
        assert!(!json.contains("playlistId"));
    }
}
