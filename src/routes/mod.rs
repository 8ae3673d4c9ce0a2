//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router carries the websocket endpoint, the mutation API's
//! announce endpoint, and the operator endpoints. Auth is assumed to have
//! happened upstream; the router only extracts the supplied identity.

pub mod events;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the hub router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/rooms/{room_id}/events", post(events::announce))
        .route("/api/presence/{user_id}", get(events::presence))
        .route("/api/stats", get(events::stats))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
