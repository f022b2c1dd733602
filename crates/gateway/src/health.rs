//! Liveness endpoint.

use axum::{Json, extract::State, response::IntoResponse};

use {crate::state::AppState, dockyard_registry::Registry as _};

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let workspaces = state
        .registry
        .list_workspaces()
        .await
        .map(|w| w.len())
        .unwrap_or(0);
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.uptime().as_secs(),
        "workspaces": workspaces,
        "storage": state.storage_mode.to_string(),
        "providers": state.providers.availability().await,
    }))
}
