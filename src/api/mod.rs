//! HTTP API module - REST endpoints and WebSocket

mod encounters;
mod websocket;

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::battlefield::{Battlefield, BattlefieldStats};
use crate::combat::EncounterManager;
use crate::config::Config;
pub use encounters::{ApiError, ErrorResponse};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EncounterManager>,
    pub battlefield: Arc<Battlefield>,
    pub config: Arc<Config>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
        .route("/ws", get(websocket::ws_handler))
        .merge(encounters::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Root endpoint
async fn root() -> impl IntoResponse {
    Json(RootResponse {
        name: "encounterd",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        encounters: state.engine.list_encounters().len(),
        battlefield: state.battlefield.stats(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    encounters: usize,
    battlefield: BattlefieldStats,
}
