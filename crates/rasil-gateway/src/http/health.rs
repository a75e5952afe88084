use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health: liveness plus a few cheap gauges.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "ws_connections": state.registry.connection_count(),
        "db": state.db.kind(),
        "ai_cooldown_active": state.cooldown.is_active(),
        "dedup_entries": state.dedup.len(),
    }))
}
