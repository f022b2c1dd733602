//! Workspace endpoints.

use {
    axum::{
        Json,
        extract::{Path, State},
        http::StatusCode,
    },
    serde::Serialize,
};

use {
    crate::{
        error::{ApiError, ApiResult},
        pipeline,
        state::AppState,
    },
    dockyard_protocol::{
        CreateFromRepoRequest, CreateFromRepoResponse, WorkspaceStatus, WorkspaceStatusResponse,
        WorkspaceSummary,
    },
    dockyard_registry::Registry as _,
};

pub async fn create_from_repo(
    State(state): State<AppState>,
    Json(request): Json<CreateFromRepoRequest>,
) -> ApiResult<(StatusCode, Json<CreateFromRepoResponse>)> {
    let (status, response) = pipeline::create_from_repo(&state, request).await?;
    Ok((status, Json(response)))
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub workspaces: Vec<WorkspaceSummary>,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<ListResponse>> {
    let mut workspaces: Vec<WorkspaceSummary> = state
        .registry
        .list_workspaces()
        .await?
        .iter()
        .map(|w| w.summary())
        .collect();
    workspaces.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(ListResponse { workspaces }))
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkspaceStatusResponse>> {
    let workspace = state
        .registry
        .get_workspace(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workspace not found: {id}")))?;
    Ok(Json(WorkspaceStatusResponse {
        id: workspace.id,
        name: workspace.name,
        status: workspace.status,
        ssh_host: workspace.ssh_host,
        ssh_port: workspace.ssh_port,
        services: workspace.service_ports,
        message: workspace.error,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResponse {
    pub workspace_id: String,
    pub status: WorkspaceStatus,
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransitionResponse>> {
    let workspace = pipeline::stop_workspace(&state, &id).await?;
    Ok(Json(TransitionResponse {
        workspace_id: workspace.id,
        status: workspace.status,
    }))
}

pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransitionResponse>> {
    let workspace = pipeline::start_workspace(&state, &id).await?;
    Ok(Json(TransitionResponse {
        workspace_id: workspace.id,
        status: workspace.status,
    }))
}

pub async fn destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransitionResponse>> {
    let workspace = pipeline::delete_workspace(&state, &id).await?;
    Ok(Json(TransitionResponse {
        workspace_id: workspace.id,
        status: workspace.status,
    }))
}
