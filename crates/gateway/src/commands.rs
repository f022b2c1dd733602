//! Asynchronous command results.
//!
//! Agents POST results here keyed by command id. Results are write-once:
//! a waiter consumes the first submission, late or duplicate arrivals are
//! acknowledged and dropped.

use {
    axum::{
        Json,
        extract::{Path, State},
        http::StatusCode,
    },
    chrono::Utc,
    tracing::{debug, warn},
};

use {
    crate::{error::ApiResult, state::AppState},
    dockyard_protocol::CommandResult,
    dockyard_registry::Registry as _,
};

pub async fn submit_result(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
    Json(mut result): Json<CommandResult>,
) -> ApiResult<StatusCode> {
    // The path id is authoritative; agents echo it in the body.
    if result.command_id != command_id {
        warn!(
            path = %command_id,
            body = %result.command_id,
            "result id mismatch, trusting path"
        );
        result.command_id = command_id.clone();
    }

    // A result doubles as a liveness signal for its node.
    if let Ok(Some(mut node)) = state.registry.get_node(&result.node_id).await {
        node.last_seen = Utc::now();
        let _ = state.registry.upsert_node(node).await;
    }

    if !state.resolve_pending(result) {
        debug!(command = %command_id, "result arrived with no waiter (late or duplicate)");
    }
    Ok(StatusCode::ACCEPTED)
}
