//! REST route handlers. All handlers are thin: they delegate to the Roster,
//! Sync bridge, or a Room and translate the result into a response.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::response::api_ok;
use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::CoordinatorError;
use crate::protocol::ServerMessage;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/v1/rooms", get(list_rooms).post(create_room))
        .route("/api/v1/rooms/{room_id}", delete(remove_room))
        .route("/api/v1/now-playing", get(now_playing))
        .route("/api/v1/openapi.json", get(openapi))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    api_ok(serde_json::json!({
        "status": "ok",
        "rooms": state.roster.list_rooms().len(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomSummary {
    room_id: String,
    playlist_key: String,
    device_count: usize,
}

async fn list_rooms(State(state): State<AppState>) -> Response {
    let rooms: Vec<RoomSummary> = state
        .roster
        .list_rooms()
        .into_iter()
        .map(|room| RoomSummary {
            room_id: room.id.clone(),
            playlist_key: room.playlist_key.clone(),
            device_count: room.socket_count(),
        })
        .collect();
    api_ok(rooms)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    id: String,
    #[serde(default)]
    playlist_key: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

async fn create_room(State(state): State<AppState>, Json(req): Json<CreateRoomRequest>) -> Response {
    let playlist_key = req.playlist_key.unwrap_or_else(|| req.id.clone());
    let name = req.name.unwrap_or_else(|| req.id.clone());
    let room = state.roster.create_room(&req.id, &playlist_key, &name);
    api_ok(RoomSummary {
        room_id: room.id.clone(),
        playlist_key: room.playlist_key.clone(),
        device_count: room.socket_count(),
    })
}

async fn remove_room(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
    if state.roster.remove_room(&room_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        CoordinatorError::RoomNotFound(room_id).into_response()
    }
}

#[derive(Deserialize)]
struct NowPlayingQuery {
    #[serde(rename = "room")]
    room_id: String,
}

/// Status-bar-shaped playback summary: `class` is derived from whether a
/// song is current and whether it's playing; `text`/`tooltip` from the
/// current song's title/artist, falling back to the room name when idle.
async fn now_playing(
    State(state): State<AppState>,
    Query(query): Query<NowPlayingQuery>,
) -> Response {
    let room = match state.roster.get_room(&query.room_id) {
        Ok(room) => room,
        Err(e) => return e.into_response(),
    };

    let (playback, current_song) = match room.state_message() {
        ServerMessage::State {
            playback,
            current_song,
            ..
        } => (playback, current_song),
        _ => unreachable!("Room::state_message always returns State"),
    };

    let class = match (&current_song, playback.is_playing) {
        (None, _) => "stopped",
        (Some(_), true) => "playing",
        (Some(_), false) => "paused",
    };

    let (text, tooltip) = match &current_song {
        Some(song) => {
            let title = song.metadata.title.clone().unwrap_or_else(|| "Untitled".to_string());
            let text = match &song.metadata.artist {
                Some(artist) => format!("{} — {}", title, artist),
                None => title.clone(),
            };
            let tooltip = format!("{} · {}", room.name(), text);
            (text, tooltip)
        }
        None => (room.name(), format!("{} · nothing playing", room.name())),
    };

    api_ok(serde_json::json!({
        "text": text,
        "tooltip": tooltip,
        "class": class,
        "song": current_song,
        "playback": playback,
        "room": room.id,
    }))
}

async fn openapi() -> Response {
    api_ok(serde_json::json!({
        "openapi": "3.0.0",
        "info": { "title": "Roomcast coordinator", "version": "1" },
        "paths": {
            "/health": { "get": { "summary": "Liveness check" } },
            "/api/v1/rooms": {
                "get": { "summary": "List live rooms" },
                "post": { "summary": "Create or fetch a room, idempotent" }
            },
            "/api/v1/rooms/{room_id}": {
                "delete": { "summary": "Remove a room" }
            },
            "/api/v1/now-playing": {
                "get": { "summary": "Current playback state for a room" }
            },
            "/ws": { "get": { "summary": "Protocol-level WebSocket connection" } }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap_services;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
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
    async fn health_returns_ok() {
        let app = create_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_then_list_room() {
        let state = test_state();
        let app = create_router(state.clone());
        let body = serde_json::json!({ "id": "r1", "playlistKey": "k1" }).to_string();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/rooms")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.roster.list_rooms().len(), 1);
    }

    #[tokio::test]
    async fn now_playing_404s_for_unknown_room() {
        let app = create_router(test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/now-playing?room=missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn now_playing_is_stopped_for_an_idle_room() {
        let state = test_state();
        state.roster.create_room("r1", "k1", "Room One");
        let app = create_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/now-playing?room=r1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["class"], "stopped");
        assert_eq!(json["room"], "r1");
    }

    #[tokio::test]
    async fn remove_room_404s_when_absent() {
        let app = create_router(test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/rooms/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_room_count() {
        let state = test_state();
        state.roster.create_room("r1", "k1", "Room One");
        let app = create_router(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["rooms"], 1);
    }
}
