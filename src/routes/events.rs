//! HTTP routes for the mutation API collaborator and operators.
//!
//! `POST /api/rooms/{room_id}/events` is the `Announce` entry point: the
//! mutation API calls it after committing a task change. The hub performs no
//! business validation beyond the event type and payload shape.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::message::{Data, ErrorCode, MessageType, validate_room_id};
use crate::services::presence::PresenceRecord;
use crate::services::relay::{Actor, AnnounceError, Announcement};
use crate::state::AppState;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Announce(#[from] AnnounceError),
}

impl ErrorCode for ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "E_BAD_REQUEST",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::Announce(e) => e.error_code(),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Announce(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "code": self.error_code(), "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

// =============================================================================
// ANNOUNCE
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct AnnounceBody {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

pub async fn announce(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(body): Json<AnnounceBody>,
) -> Result<(StatusCode, Json<Announcement>), ApiError> {
    let room_id = validate_room_id(&room_id, state.config.max_room_id_len)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let Some(kind) = MessageType::parse(&body.kind) else {
        return Err(ApiError::BadRequest(format!("unknown event type: {}", body.kind)));
    };
    let serde_json::Value::Object(map) = body.data else {
        return Err(ApiError::BadRequest("data must be a JSON object".into()));
    };
    let data: Data = map.into_iter().collect();

    let actor = match body.user_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        Some(user_id) => Actor::new(user_id, body.username.as_deref().unwrap_or(user_id)),
        None => Actor::system(),
    };

    let announcement = state
        .relay
        .announce(&room_id, kind, data, &actor)
        .await
        .inspect_err(|e| warn!(room = %room_id, error = %e, "api: announce rejected"))?;
    Ok((StatusCode::ACCEPTED, Json(announcement)))
}

// =============================================================================
// PRESENCE / STATS
// =============================================================================

pub async fn presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceRecord>, ApiError> {
    state
        .presence
        .get(&user_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("presence for {user_id}")))
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
    pub users_online: usize,
    pub active_signals: usize,
}

pub async fn stats(State(state): State<AppState>) -> Json<HubStats> {
    let counts = state.registry.counts();
    Json(HubStats {
        connections: counts.connections,
        rooms: counts.rooms,
        users_online: state.presence.len().await,
        active_signals: state.router.active_signals(),
    })
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
