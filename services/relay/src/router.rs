//! Axum Router Configuration
//!
//! Two transports over one session core: the persistent socket at `/ws` and
//! the chunked-HTTP endpoint at `/voice`.

use crate::{handlers::voice_handler, state::AppState, ws::ws_handler};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Creates the main Axum router for the relay.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/voice", post(voice_handler))
        .with_state(app_state)
}
