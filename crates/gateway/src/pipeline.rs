//! The workspace state machine and its hardest path, create-from-repo:
//! repository resolution → fork-on-demand → token refresh → node
//! selection → session dispatch → status patch.
//!
//! Operations for one workspace id are serialized through a per-id mutex
//! held across the whole transition; operations on different workspaces
//! proceed in parallel.

use {
    axum::http::StatusCode,
    chrono::Utc,
    std::future::Future,
    tracing::{info, warn},
};

use {
    crate::{
        dispatch::{dispatch_and_wait, dispatch_forget},
        error::{ApiError, ApiResult},
        scheduler::select_node,
        state::AppState,
    },
    dockyard_github::ForksClient,
    dockyard_protocol::{
        Command, CommandAction, CommandStatus, CommandType, CreateFromRepoRequest,
        CreateFromRepoResponse, GITHUB_TOKEN_ENV, SessionCreated, WORKSPACE_CREATE_TIMEOUT_SECS,
        WORKSPACE_DELETE_TIMEOUT_SECS, WorkspaceStatus, error_codes, params,
        valid_workspace_name,
    },
    dockyard_registry::{GithubFork, GithubInstallation, Node, Registry as _, Workspace, WorkspaceRepo},
};

/// Tokens are refreshed when fewer than five minutes remain.
const TOKEN_REFRESH_WINDOW_SECS: i64 = 300;

/// Bounded retries for transient GitHub failures (5xx, rate limits).
/// Non-idempotent steps go through their own check-then-create preface
/// first, so a retry never duplicates a fork.
const GITHUB_RETRIES: u32 = 2;

async fn with_github_retries<T, F, Fut>(op: F) -> dockyard_github::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = dockyard_github::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < GITHUB_RETRIES => {
                attempt += 1;
                warn!(error = %e, attempt, "transient GitHub failure, backing off");
                tokio::time::sleep(std::time::Duration::from_millis(
                    250 * 2u64.pow(attempt),
                ))
                .await;
            },
            Err(e) => return Err(e),
        }
    }
}

/// The URL a user must visit to link GitHub when no installation exists.
pub fn github_auth_url(state: &AppState, username: &str) -> String {
    match &state.oauth {
        Some(oauth) => oauth.authorize_url(username),
        None => "https://github.com/login/oauth/authorize".to_string(),
    }
}

/// Provider names known anywhere in the deployment: locally or on any
/// registered node.
async fn known_providers(state: &AppState) -> ApiResult<Vec<String>> {
    let mut names: Vec<String> = state
        .providers
        .names()
        .into_iter()
        .map(str::to_string)
        .collect();
    for node in state.registry.list_nodes().await? {
        names.extend(node.capabilities);
    }
    names.sort();
    names.dedup();
    Ok(names)
}

fn validate(request: &CreateFromRepoRequest) -> ApiResult<()> {
    if !valid_workspace_name(&request.workspace_name) {
        return Err(ApiError::invalid_request(
            "workspace name must match [a-z0-9-]{1,64}",
            "workspaceName",
        ));
    }
    if request.repo.owner.is_empty() || request.repo.name.is_empty() || request.repo.url.is_empty()
    {
        return Err(ApiError::invalid_request(
            "repo owner, name and url are required",
            "repo",
        ));
    }
    if request.github_username.is_empty() {
        return Err(ApiError::invalid_request(
            "githubUsername is required",
            "githubUsername",
        ));
    }
    Ok(())
}

/// Refresh the installation token when it is close to expiry and persist
/// the new one. Holding the per-workspace lock already serializes the
/// refresh for this pipeline; the upsert publishes atomically.
async fn refresh_installation_if_needed(
    state: &AppState,
    installation: &mut GithubInstallation,
) -> ApiResult<()> {
    let now = Utc::now();
    if installation.token_ttl_secs(now) >= TOKEN_REFRESH_WINDOW_SECS {
        return Ok(());
    }

    let refreshable = installation.id.parse::<u64>().ok().zip(state.github_app.as_ref());
    match refreshable {
        Some((installation_id, app)) => {
            let token =
                with_github_retries(|| app.create_installation_token(installation_id)).await?;
            installation.access_token = token.token.clone();
            installation.token_expires_at = token.expires_at;
            installation.updated_at = now;
            state
                .registry
                .upsert_installation(installation.clone())
                .await?;
            info!(installation = installation_id, "installation token refreshed");
            Ok(())
        },
        None if installation.token_ttl_secs(now) > 0 => Ok(()),
        None => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            error_codes::AUTH_REQUIRED,
            "stored token expired and cannot be refreshed; re-link your GitHub account",
        )),
    }
}

/// Decide whether provisioning must go through a fork. The request's
/// explicit flag wins; the heuristic only covers requests without it.
fn fork_required(request: &CreateFromRepoRequest, account_login: &str) -> bool {
    match request.repo.is_fork {
        Some(flag) => flag,
        None => request.repo.private && request.repo.owner != account_login,
    }
}

/// Idempotently ensure a fork record exists and return (clone URL, fork URL).
async fn ensure_fork(
    state: &AppState,
    installation: &GithubInstallation,
    user_id: &str,
    request: &CreateFromRepoRequest,
) -> ApiResult<GithubFork> {
    if let Some(existing) = state
        .registry
        .get_fork(user_id, &request.repo.owner, &request.repo.name)
        .await?
    {
        return Ok(existing);
    }

    let mut client = ForksClient::new(installation.access_token.clone());
    if let Some(base) = &state.github_api_base {
        client = client.with_api_base(base);
    }
    let fork =
        with_github_retries(|| client.fork_repository(&request.repo.owner, &request.repo.name))
            .await?;
    let record = GithubFork {
        user_id: user_id.to_string(),
        original_owner: request.repo.owner.clone(),
        original_repo: request.repo.name.clone(),
        fork_owner: fork.owner.login.clone(),
        fork_url: dockyard_github::to_https_clone_url(&fork.clone_url),
        created_at: Utc::now(),
    };
    state.registry.upsert_fork(record.clone()).await?;
    info!(
        user = user_id,
        upstream = %format!("{}/{}", request.repo.owner, request.repo.name),
        fork = %record.fork_url,
        "fork ensured"
    );
    Ok(record)
}

fn session_create_command(
    state: &AppState,
    workspace: &Workspace,
    token: &str,
) -> Command {
    let workspace_path = state
        .config
        .workspaces
        .root_dir
        .join(&workspace.id)
        .display()
        .to_string();
    let mut env = std::collections::HashMap::new();
    env.insert(GITHUB_TOKEN_ENV.to_string(), token.to_string());

    Command::new(
        CommandType::Session,
        CommandAction::Create,
        WORKSPACE_CREATE_TIMEOUT_SECS,
    )
    .with_session(&workspace.id)
    .with_param(params::PROVIDER, serde_json::json!(workspace.provider))
    .with_param(params::IMAGE, serde_json::json!(workspace.image))
    .with_param(params::ENV, serde_json::json!(env))
    .with_param(params::SERVICES, serde_json::json!(workspace.services))
    .with_param(params::WORKSPACE_PATH, serde_json::json!(workspace_path))
}

fn lifecycle_command(workspace: &Workspace, action: CommandAction, timeout_secs: u64) -> Command {
    Command::new(CommandType::Session, action, timeout_secs)
        .with_session(&workspace.id)
        .with_param(params::PROVIDER, serde_json::json!(workspace.provider))
}

async fn node_for(state: &AppState, workspace: &Workspace) -> ApiResult<Node> {
    let node_id = workspace
        .node_id
        .as_deref()
        .ok_or_else(|| ApiError::internal("workspace has no assigned node"))?;
    state
        .registry
        .get_node(node_id)
        .await?
        .ok_or_else(|| {
            ApiError::insufficient_resources(format!(
                "node {node_id} is no longer registered; delete the workspace or restart the agent"
            ))
        })
}

pub async fn create_from_repo(
    state: &AppState,
    request: CreateFromRepoRequest,
) -> ApiResult<(StatusCode, CreateFromRepoResponse)> {
    validate(&request)?;

    let known = known_providers(state).await?;
    if !known.iter().any(|p| p == &request.provider) {
        return Err(ApiError::invalid_provider(&request.provider, &known));
    }

    // Identity and installation come first; nothing is created without them.
    let user = state
        .registry
        .get_user_by_username(&request.github_username)
        .await?
        .ok_or_else(|| ApiError::auth_required(github_auth_url(state, &request.github_username)))?;
    let mut installation = state
        .registry
        .get_installation_by_user(&user.id)
        .await?
        .ok_or_else(|| ApiError::auth_required(github_auth_url(state, &request.github_username)))?;

    // Serialize creates per (user, name) so duplicate requests cannot race.
    let create_lock = state.workspace_lock(&format!("create:{}:{}", user.id, request.workspace_name));
    let _create_guard = create_lock.lock().await;

    if let Some(existing) = state
        .registry
        .get_workspace_by_name(&user.id, &request.workspace_name)
        .await?
        && existing.status != WorkspaceStatus::Failed
    {
        return Err(ApiError::workspace_exists(&request.workspace_name));
    }

    refresh_installation_if_needed(state, &mut installation).await?;

    // Fork on demand; the effective clone URL is the fork's when one is used.
    let needs_fork = fork_required(&request, &installation.account_login);
    let (clone_url, fork_created, fork_url) = if needs_fork {
        let fork = ensure_fork(state, &installation, &user.id, &request).await?;
        (fork.fork_url.clone(), true, Some(fork.fork_url))
    } else {
        (request.repo.url.clone(), false, None)
    };

    let node = select_node(state, &request.provider).await?;

    let workspace = Workspace {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        name: request.workspace_name.clone(),
        status: WorkspaceStatus::Provisioning,
        provider: request.provider.clone(),
        image: request.image.clone(),
        repo: WorkspaceRepo {
            owner: request.repo.owner.clone(),
            name: request.repo.name.clone(),
            url: clone_url,
            branch: request.repo.branch.clone(),
            commit: request.repo.commit.clone(),
        },
        fork_created,
        fork_url,
        ssh_host: None,
        ssh_port: 0,
        node_id: Some(node.id.clone()),
        services: request.services.clone(),
        service_ports: Default::default(),
        error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    state.registry.create_workspace(workspace.clone()).await?;

    let command = session_create_command(state, &workspace, installation.token());
    let command_id = command.id.clone();
    let outcome = dispatch_and_wait(state, &node, command).await;

    let mut workspace = workspace;
    match outcome {
        Ok(result) if result.status == CommandStatus::Success => {
            let created: SessionCreated = serde_json::from_str(&result.output).map_err(|e| {
                ApiError::internal(format!("agent returned an unparseable session payload: {e}"))
            })?;
            workspace.status = WorkspaceStatus::Running;
            workspace.ssh_host = Some(ssh_host_for(state, &node));
            workspace.ssh_port = created.ssh_port;
            workspace.service_ports = created.services;
            workspace.updated_at = Utc::now();
            state.registry.update_workspace(workspace.clone()).await?;
            info!(
                workspace = %workspace.id,
                node = %node.id,
                ssh_port = workspace.ssh_port,
                "workspace running"
            );

            Ok((
                StatusCode::CREATED,
                CreateFromRepoResponse {
                    workspace_id: workspace.id,
                    status: WorkspaceStatus::Running,
                    ssh_host: workspace.ssh_host,
                    ssh_port: workspace.ssh_port,
                    services: workspace.service_ports,
                    fork_created: workspace.fork_created,
                    fork_url: workspace.fork_url,
                },
            ))
        },
        Ok(result) => {
            let reason = result
                .error
                .unwrap_or_else(|| "provider reported failure".into());
            fail_workspace(state, &mut workspace, &reason).await;
            dispatch_forget(
                state,
                &node,
                lifecycle_command(&workspace, CommandAction::Destroy, WORKSPACE_DELETE_TIMEOUT_SECS),
            )
            .await;
            Err(ApiError::provider_error(
                &workspace.provider,
                "session.create",
                reason,
            ))
        },
        Err(e) => {
            warn!(workspace = %workspace.id, command = %command_id, "session.create dispatch failed");
            fail_workspace(state, &mut workspace, &e.message).await;
            dispatch_forget(
                state,
                &node,
                lifecycle_command(&workspace, CommandAction::Destroy, WORKSPACE_DELETE_TIMEOUT_SECS),
            )
            .await;
            Err(e)
        },
    }
}

fn ssh_host_for(state: &AppState, node: &Node) -> String {
    if crate::dispatch::is_local_node(node) {
        state
            .config
            .server
            .public_host
            .clone()
            .unwrap_or_else(|| "127.0.0.1".into())
    } else {
        node.host.clone()
    }
}

async fn fail_workspace(state: &AppState, workspace: &mut Workspace, reason: &str) {
    workspace.status = WorkspaceStatus::Failed;
    workspace.error = Some(reason.to_string());
    workspace.ssh_port = 0;
    workspace.updated_at = Utc::now();
    if let Err(e) = state.registry.update_workspace(workspace.clone()).await {
        warn!(workspace = %workspace.id, error = %e, "failed to record workspace failure");
    }
}

pub async fn stop_workspace(state: &AppState, id: &str) -> ApiResult<Workspace> {
    let lock = state.workspace_lock(id);
    let _guard = lock.lock().await;

    let mut workspace = state
        .registry
        .get_workspace(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workspace not found: {id}")))?;

    match workspace.status {
        WorkspaceStatus::Stopped => return Ok(workspace),
        WorkspaceStatus::Running => {},
        other => {
            return Err(ApiError::invalid_request(
                format!("workspace is {other}; only running workspaces stop"),
                "status",
            ));
        },
    }

    let node = node_for(state, &workspace).await?;
    let command =
        lifecycle_command(&workspace, CommandAction::Stop, WORKSPACE_DELETE_TIMEOUT_SECS);
    let result = dispatch_and_wait(state, &node, command).await?;
    if result.status != CommandStatus::Success {
        return Err(ApiError::provider_error(
            &workspace.provider,
            "session.stop",
            result.error.unwrap_or_else(|| "stop failed".into()),
        ));
    }

    workspace.status = WorkspaceStatus::Stopped;
    workspace.ssh_port = 0;
    workspace.updated_at = Utc::now();
    state.registry.update_workspace(workspace.clone()).await?;
    info!(workspace = %workspace.id, "workspace stopped");
    Ok(workspace)
}

/// Re-attach a stopped workspace: stopped → provisioning → running.
pub async fn start_workspace(state: &AppState, id: &str) -> ApiResult<Workspace> {
    let lock = state.workspace_lock(id);
    let _guard = lock.lock().await;

    let mut workspace = state
        .registry
        .get_workspace(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workspace not found: {id}")))?;

    match workspace.status {
        WorkspaceStatus::Running => return Ok(workspace),
        WorkspaceStatus::Stopped => {},
        other => {
            return Err(ApiError::invalid_request(
                format!("workspace is {other}; only stopped workspaces start"),
                "status",
            ));
        },
    }

    let node = node_for(state, &workspace).await?;
    workspace.status = WorkspaceStatus::Provisioning;
    workspace.updated_at = Utc::now();
    state.registry.update_workspace(workspace.clone()).await?;

    let start =
        lifecycle_command(&workspace, CommandAction::Start, WORKSPACE_CREATE_TIMEOUT_SECS);
    match dispatch_and_wait(state, &node, start).await {
        Ok(r) if r.status == CommandStatus::Success => {},
        Ok(r) => {
            let reason = r.error.unwrap_or_else(|| "start failed".into());
            fail_workspace(state, &mut workspace, &reason).await;
            return Err(ApiError::provider_error(
                &workspace.provider,
                "session.start",
                reason,
            ));
        },
        Err(e) => {
            fail_workspace(state, &mut workspace, &e.message).await;
            return Err(e);
        },
    }

    // Ports may differ after a restart; read them back.
    let status =
        lifecycle_command(&workspace, CommandAction::Status, WORKSPACE_DELETE_TIMEOUT_SECS);
    let status_result = dispatch_and_wait(state, &node, status).await?;
    if status_result.status == CommandStatus::Success
        && let Ok(session) =
            serde_json::from_str::<dockyard_providers::Session>(&status_result.output)
    {
        workspace.ssh_port = session.ssh_port;
        if !session.services.is_empty() {
            workspace.service_ports = session.services;
        }
    }

    workspace.status = WorkspaceStatus::Running;
    workspace.ssh_host = Some(ssh_host_for(state, &node));
    workspace.updated_at = Utc::now();
    state.registry.update_workspace(workspace.clone()).await?;
    info!(workspace = %workspace.id, "workspace re-attached");
    Ok(workspace)
}

/// Delete from any non-terminal state; pending/provisioning deletes are
/// the cancellation path.
pub async fn delete_workspace(state: &AppState, id: &str) -> ApiResult<Workspace> {
    let lock = state.workspace_lock(id);
    let _guard = lock.lock().await;

    let mut workspace = state
        .registry
        .get_workspace(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workspace not found: {id}")))?;

    if workspace.status == WorkspaceStatus::Deleted {
        return Ok(workspace);
    }

    // Best-effort teardown; the record transitions regardless so operators
    // are never stuck with an undeletable workspace.
    if let Some(node_id) = workspace.node_id.clone()
        && let Ok(Some(node)) = state.registry.get_node(&node_id).await
    {
        dispatch_forget(
            state,
            &node,
            lifecycle_command(&workspace, CommandAction::Destroy, WORKSPACE_DELETE_TIMEOUT_SECS),
        )
        .await;
    }

    workspace.status = WorkspaceStatus::Deleted;
    workspace.ssh_port = 0;
    workspace.updated_at = Utc::now();
    state.registry.update_workspace(workspace.clone()).await?;
    info!(workspace = %workspace.id, "workspace deleted");
    Ok(workspace)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        dockyard_protocol::RepoSpec,
    };

    fn request(is_fork: Option<bool>, private: bool, owner: &str) -> CreateFromRepoRequest {
        CreateFromRepoRequest {
            github_username: "alice".into(),
            workspace_name: "feature-x".into(),
            repo: RepoSpec {
                owner: owner.into(),
                name: "epson-eshop".into(),
                url: "https://github.com/oursky/epson-eshop.git".into(),
                branch: Some("main".into()),
                commit: None,
                is_fork,
                private,
            },
            provider: "lxc".into(),
            image: "ubuntu:22.04".into(),
            services: vec![],
        }
    }

    #[test]
    fn explicit_flag_beats_heuristic() {
        assert!(fork_required(&request(Some(true), false, "alice"), "alice"));
        assert!(!fork_required(&request(Some(false), true, "oursky"), "alice"));
    }

    #[test]
    fn heuristic_is_private_and_not_owner() {
        assert!(fork_required(&request(None, true, "oursky"), "alice"));
        assert!(!fork_required(&request(None, true, "alice"), "alice"));
        assert!(!fork_required(&request(None, false, "oursky"), "alice"));
    }

    #[test]
    fn validation_rejects_bad_names() {
        let mut bad = request(None, false, "oursky");
        bad.workspace_name = "Feature X".into();
        assert!(validate(&bad).is_err());

        bad.workspace_name = "a".repeat(65);
        assert!(validate(&bad).is_err());

        bad.workspace_name = "a".repeat(64);
        assert!(validate(&bad).is_ok());
    }

    #[test]
    fn validation_requires_repo_fields() {
        let mut bad = request(None, false, "oursky");
        bad.repo.url = String::new();
        assert!(validate(&bad).is_err());
    }

    #[tokio::test]
    async fn transient_github_failures_are_retried() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = AtomicU32::new(0);
        let result: dockyard_github::Result<&str> = with_github_retries(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(dockyard_github::Error::Transient("502".into()))
                } else {
                    Ok("made it")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "made it");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_github_failures_are_not_retried() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = AtomicU32::new(0);
        let result: dockyard_github::Result<()> = with_github_retries(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(dockyard_github::Error::Conflict("422".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
