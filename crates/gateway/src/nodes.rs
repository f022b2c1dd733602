//! Node registration, heartbeat, and deregistration.
//!
//! The registry's node rows are the authoritative state; agent-reported
//! status is advisory. A registration carrying recovered session ids lets
//! the server re-associate surviving workspaces and fail the orphans.

use {
    axum::{
        Json,
        extract::{Path, State},
        http::StatusCode,
    },
    chrono::Utc,
    serde::Serialize,
    tracing::{info, warn},
};

use {
    crate::{
        error::{ApiError, ApiResult},
        state::AppState,
    },
    dockyard_protocol::{HeartbeatRequest, NodeRegistration, NodeStatus, WorkspaceStatus},
    dockyard_registry::{Node, Registry as _},
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeResponse {
    pub node_id: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(registration): Json<NodeRegistration>,
) -> ApiResult<(StatusCode, Json<RegisterNodeResponse>)> {
    if registration.id.is_empty() {
        return Err(ApiError::invalid_request("node id is required", "id"));
    }

    let node = Node {
        id: registration.id.clone(),
        name: registration.name.clone(),
        host: registration.host.clone(),
        port: registration.port,
        status: NodeStatus::Active,
        version: registration.version.clone(),
        last_seen: Utc::now(),
        capabilities: registration.capabilities.clone(),
        labels: registration.labels.clone(),
        metadata: registration.metadata.clone(),
    };
    state.registry.upsert_node(node.clone()).await?;
    crate::dispatch::ensure_node_transport(&state, &node).await?;

    reconcile_sessions(&state, &registration).await?;

    info!(
        node = %node.id,
        capabilities = ?node.capabilities,
        recovered = registration.recovered_sessions.len(),
        "node registered"
    );
    Ok((
        StatusCode::CREATED,
        Json(RegisterNodeResponse {
            node_id: registration.id,
        }),
    ))
}

/// Workspaces assigned to this node that the agent no longer holds are
/// failed; surviving ones are left untouched.
async fn reconcile_sessions(state: &AppState, registration: &NodeRegistration) -> ApiResult<()> {
    let assigned = state
        .registry
        .list_workspaces_by_node(&registration.id)
        .await?;
    for mut workspace in assigned {
        let live = matches!(
            workspace.status,
            WorkspaceStatus::Provisioning | WorkspaceStatus::Running
        );
        if !live {
            continue;
        }
        if registration.recovered_sessions.contains(&workspace.id) {
            continue;
        }
        warn!(
            workspace = %workspace.id,
            node = %registration.id,
            "session missing after agent restart, failing workspace"
        );
        workspace.status = WorkspaceStatus::Failed;
        workspace.error = Some("session missing after agent restart".into());
        workspace.ssh_port = 0;
        workspace.updated_at = Utc::now();
        state.registry.update_workspace(workspace).await?;
    }
    Ok(())
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(beat): Json<HeartbeatRequest>,
) -> ApiResult<StatusCode> {
    let mut node = state
        .registry
        .get_node(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("node not registered: {id}")))?;

    node.last_seen = beat.last_seen.min(Utc::now());
    // A heartbeat from an offline node brings it back.
    node.status = match beat.status {
        NodeStatus::Offline | NodeStatus::Unknown => NodeStatus::Active,
        status => status,
    };
    state.registry.upsert_node(node).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deregister(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    // Running workspaces lose their host when the node leaves.
    let assigned = state.registry.list_workspaces_by_node(&id).await?;
    for mut workspace in assigned {
        if matches!(
            workspace.status,
            WorkspaceStatus::Provisioning | WorkspaceStatus::Running
        ) {
            workspace.status = WorkspaceStatus::Failed;
            workspace.error = Some("node_unreachable".into());
            workspace.ssh_port = 0;
            workspace.updated_at = Utc::now();
            state.registry.update_workspace(workspace).await?;
        }
    }

    state.registry.remove_node(&id).await?;
    info!(node = %id, "node deregistered");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub capabilities: Vec<String>,
    pub last_seen: chrono::DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<NodeView>,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<ListNodesResponse>> {
    let mut nodes: Vec<NodeView> = state
        .registry
        .list_nodes()
        .await?
        .into_iter()
        .map(|n| NodeView {
            id: n.id,
            name: n.name,
            host: n.host,
            port: n.port,
            status: n.status,
            capabilities: n.capabilities,
            last_seen: n.last_seen,
            version: n.version,
        })
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(ListNodesResponse { nodes }))
}
