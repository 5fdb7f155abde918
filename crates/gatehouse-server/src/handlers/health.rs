//! Health and metrics endpoints

use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use crate::server::AppState;

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let plugins = state.plugins.plugin_names().await;
    Json(json!({
        "status": "ok",
        "plugins": plugins,
    }))
}

/// `GET /metrics` (Prometheus text exposition)
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}
