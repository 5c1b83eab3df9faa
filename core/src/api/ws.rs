//! The WebSocket endpoint: upgrades, binds a socket to a Room+Device, and
//! pumps [`ClientMessage`]s in and [`ServerMessage`]s out for the
//! connection's lifetime.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::Room;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let guard = state.ws_manager.register();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerMessage>(state.config.outbound_queue_max);

    let writer = tokio::spawn(async move {
        while let Some(msg) = frame_rx.recv().await {
            if ws_tx.send(Message::Text(msg.to_json())).await.is_err() {
                break;
            }
        }
    });

    let mut bound: Option<(Arc<Room>, String)> = None;

    loop {
        tokio::select! {
            _ = guard.cancel_token().cancelled() => break,
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = dispatch(&state, &mut bound, &text, &frame_tx).await {
                            log::debug!("[Ws] {}", e);
                            let _ = frame_tx.try_send(ServerMessage::Error {
                                message: e.as_ws_message(),
                            });
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("[Ws] socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    if let Some((room, device_id)) = bound {
        room.leave(&device_id);
        log::info!("[Ws] {} left room {}", device_id, room.id);
    }
    writer.abort();
}

async fn dispatch(
    state: &AppState,
    bound: &mut Option<(Arc<Room>, String)>,
    text: &str,
    frame_tx: &mpsc::Sender<ServerMessage>,
) -> CoordinatorResult<()> {
    let msg: ClientMessage =
        serde_json::from_str(text).map_err(|e| CoordinatorError::Protocol(e.to_string()))?;

    match msg {
        ClientMessage::Join {
            room_id,
            playlist_id,
            device_id,
            device_name,
            role,
            playlist_key,
            room_name,
            protocol_version,
        } => {
            let room = resolve_room(
                state,
                room_id.as_deref(),
                playlist_id.as_deref(),
                playlist_key.as_deref(),
                room_name.as_deref(),
            )
            .await?;

            let outcome =
                room.join(&device_id, &device_name, role, protocol_version, frame_tx.clone())?;
            let _ = frame_tx.try_send(ServerMessage::JoinAck {
                room_id: outcome.room_id,
                playlist_id: Some(room.playlist_key.clone()),
                device_id: outcome.device_id,
                protocol_version: outcome.protocol_version,
            });
            let _ = frame_tx.try_send(room.state_message());
            let _ = frame_tx.try_send(room.queue_message());

            log::info!("[Ws] {} joined room {}", device_id, room.id);
            *bound = Some((room, device_id));
            Ok(())
        }
        other => {
            let (room, device_id) = bound.as_ref().ok_or_else(|| {
                CoordinatorError::Protocol("must join before sending further frames".into())
            })?;

            match other {
                ClientMessage::Command {
                    action,
                    payload,
                    target_device_id,
                } => room.handle_command(device_id, action, payload, target_device_id),
                ClientMessage::Sync {
                    current_song_id,
                    is_playing,
                    current_time,
                    duration,
                } => {
                    room.handle_sync(device_id, current_song_id, is_playing, current_time, duration);
                    Ok(())
                }
                ClientMessage::SetRole { role } => room.set_role(device_id, role),
                ClientMessage::SongEnded {} => {
                    room.handle_song_ended(device_id);
                    Ok(())
                }
                ClientMessage::RenameDevice { target_device_id, name } => {
                    room.rename_device(&target_device_id, &name)
                }
                ClientMessage::Ping { client_time } => {
                    let _ = frame_tx.try_send(room.handle_ping(client_time));
                    Ok(())
                }
                ClientMessage::Join { .. } => unreachable!("handled above"),
            }
        }
    }
}

/// Resolves a `join` frame's room identity: an explicit `roomId`/`playlistId`
/// is used verbatim, a bare `playlistKey` is resolved through the Sync
/// bridge's write-through cache. The Room is created on first reference
/// (idempotent, see [`crate::roster::Roster::create_room`]).
async fn resolve_room(
    state: &AppState,
    room_id: Option<&str>,
    playlist_id: Option<&str>,
    playlist_key: Option<&str>,
    room_name: Option<&str>,
) -> CoordinatorResult<Arc<Room>> {
    let resolved_id = if let Some(id) = room_id.or(playlist_id) {
        id.to_string()
    } else if let Some(key) = playlist_key {
        let record = state
            .sync_bridge
            .resolve_by_key(key)
            .await?
            .ok_or_else(|| CoordinatorError::RoomNotFound(key.to_string()))?;
        record.id
    } else {
        return Err(CoordinatorError::Protocol(
            "join requires roomId, playlistId, or playlistKey".into(),
        ));
    };

    let name = room_name.unwrap_or(&resolved_id).to_string();
    Ok(state.roster.create_room(&resolved_id, &resolved_id, &name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap_services;
    use crate::config::Config;

    fn app_state() -> AppState {
        let services = bootstrap_services(&Config::default());
        AppState {
            roster: services.roster,
            storage: services.storage,
            sync_bridge: services.sync_bridge,
            ws_manager: Arc::new(crate::api::ws_connection::WsConnectionManager::new()),
            config: Arc::new(Config::default()),
        }
    }

    #[tokio::test]
    async fn resolve_room_requires_some_identity() {
        let state = app_state();
        let err = resolve_room(&state, None, None, None, None).await.unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[tokio::test]
    async fn resolve_room_by_explicit_room_id_is_idempotent() {
        let state = app_state();
        let a = resolve_room(&state, Some("r1"), None, None, Some("Room One"))
            .await
            .unwrap();
        let b = resolve_room(&state, Some("r1"), None, None, None).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
