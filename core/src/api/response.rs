//! Small JSON response helpers shared by the REST handlers in [`super::http`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// `200 OK` with a JSON body.
pub fn api_ok<T: Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}
