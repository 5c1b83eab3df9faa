//! Centralized error types for the Roomcast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Roomcast server.
///
/// Variants are grouped by the error kinds in the error-handling design:
/// protocol errors (malformed frames), domain errors (unknown room/device,
/// unplayable song), upstream errors (storage, invalidation bus), and
/// resource errors (socket queue overflow).
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum CoordinatorError {
    /// A client frame failed schema validation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A message referenced a room id that has no live Room.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// A room-scoped create collided with an existing playlist-key binding
    /// in an inconsistent way (should not happen; create is idempotent).
    #[error("room already exists: {0}")]
    RoomAlreadyExists(String),

    /// A command targeted a device id not present in the room's roster.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A command referenced a song that is not in a playable status.
    #[error("song not playable: {0}")]
    SongNotPlayable(String),

    /// The storage interface returned an error or timed out.
    #[error("storage error: {0}")]
    Storage(String),

    /// The invalidation bus connection or consume loop failed.
    #[error("invalidation bus error: {0}")]
    Bus(String),

    /// A socket's outbound queue overflowed; the socket is treated as closed.
    #[error("outbound queue overflow for socket: {0}")]
    QueueOverflow(String),

    /// Client requested a protocol version the server cannot speak.
    #[error("protocol version {0} not supported")]
    UnsupportedProtocolVersion(u32),

    /// Configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Catch-all for conditions that should not occur in practice.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::RoomNotFound(_) => "room_not_found",
            Self::RoomAlreadyExists(_) => "room_already_exists",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::SongNotPlayable(_) => "song_not_playable",
            Self::Storage(_) => "storage_error",
            Self::Bus(_) => "bus_error",
            Self::QueueOverflow(_) => "queue_overflow",
            Self::UnsupportedProtocolVersion(_) => "unsupported_protocol_version",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code for the REST surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RoomNotFound(_) | Self::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            Self::RoomAlreadyExists(_) => StatusCode::CONFLICT,
            Self::Protocol(_)
            | Self::SongNotPlayable(_)
            | Self::UnsupportedProtocolVersion(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Bus(_) | Self::QueueOverflow(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Renders this error as a WebSocket `error{message}` frame body.
    ///
    /// Per the protocol's framing rule, WS-surface errors carry only a
    /// human-readable message and never close the socket.
    pub fn as_ws_message(&self) -> String {
        self.to_string()
    }
}

impl ErrorCode for CoordinatorError {
    fn code(&self) -> &'static str {
        CoordinatorError::code(self)
    }
}

/// Convenient Result alias for application-wide operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_not_found_returns_correct_code() {
        let err = CoordinatorError::RoomNotFound("r1".into());
        assert_eq!(err.code(), "room_not_found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn song_not_playable_is_bad_request() {
        let err = CoordinatorError::SongNotPlayable("s1".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn ws_message_carries_only_the_display_text() {
        let err = CoordinatorError::DeviceNotFound("d1".into());
        assert_eq!(err.as_ws_message(), "device not found: d1");
    }
}
