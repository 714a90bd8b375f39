//! HTTP route configuration.

use std::sync::Arc;

use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::transport::ws_device_handler;

/// Create the device-facing router.
///
/// # Endpoints
///
/// `GET /` - health and version probe
/// `GET /ws` - WebSocket upgrade for device control and audio
pub fn create_device_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(health_check))
        .route("/ws", get(ws_device_handler))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
    }))
}
