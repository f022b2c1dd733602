//! User registration endpoints.

use {
    axum::{Json, extract::State, http::StatusCode},
    serde::{Deserialize, Serialize},
    tracing::info,
};

use {
    crate::{
        error::{ApiError, ApiResult},
        state::AppState,
    },
    dockyard_registry::{Registry as _, model::User},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub public_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub user_id: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    if request.username.is_empty() {
        return Err(ApiError::invalid_request("username is required", "username"));
    }
    let user = User::new(&request.username, &request.public_key);
    state.registry.register_user(user.clone()).await?;
    info!(user = %user.id, username = %user.username, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id: user.id }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterGithubRequest {
    pub github_username: String,
    #[allow(dead_code)]
    #[serde(default)]
    pub github_id: Option<i64>,
    #[serde(default)]
    pub ssh_pubkey: String,
    #[serde(default)]
    pub ssh_pubkey_fingerprint: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterGithubResponse {
    pub user_id: String,
    pub github_username: String,
}

/// Link a GitHub identity to a (possibly new) user. Idempotent on the
/// GitHub username.
pub async fn register_github(
    State(state): State<AppState>,
    Json(request): Json<RegisterGithubRequest>,
) -> ApiResult<(StatusCode, Json<RegisterGithubResponse>)> {
    if request.github_username.is_empty() {
        return Err(ApiError::invalid_request(
            "githubUsername is required",
            "githubUsername",
        ));
    }

    if let Some(existing) = state
        .registry
        .get_user_by_username(&request.github_username)
        .await?
    {
        return Ok((
            StatusCode::OK,
            Json(RegisterGithubResponse {
                user_id: existing.id,
                github_username: existing.username,
            }),
        ));
    }

    let user = User::new(&request.github_username, &request.ssh_pubkey);
    state.registry.register_user(user.clone()).await?;
    info!(
        user = %user.id,
        github = %request.github_username,
        fingerprint = request.ssh_pubkey_fingerprint.as_deref().unwrap_or("-"),
        "github identity registered"
    );
    Ok((
        StatusCode::CREATED,
        Json(RegisterGithubResponse {
            user_id: user.id,
            github_username: request.github_username,
        }),
    ))
}
