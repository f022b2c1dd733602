#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end API tests: the router bound on an ephemeral port, an
//! in-memory (or temp sqlite) registry behind it, and — for the
//! provisioning paths — a fake node agent that acks commands and POSTs
//! results back the way a real agent does.

use std::{collections::HashMap, sync::Arc};

use {
    axum::{Json, Router, extract::State, http::StatusCode, routing::{get, post}},
    chrono::{Duration, Utc},
    secrecy::Secret,
    tokio_util::sync::CancellationToken,
};

use {
    dockyard_common::DockyardConfig,
    dockyard_gateway::{GatewayState, build_router},
    dockyard_protocol::{
        Command, CommandResult, CommandStatus, HeartbeatRequest, NodeRegistration, NodeStatus,
        SessionCreated,
    },
    dockyard_providers::ProviderSet,
    dockyard_registry::{
        GithubInstallation, MemoryRegistry, Registry, SqliteRegistry, StorageMode, model::User,
    },
    dockyard_transport::TransportManager,
};

struct TestServer {
    base_url: String,
    registry: Arc<dyn Registry>,
    _shutdown: CancellationToken,
}

async fn spawn_gateway_with_registry(
    registry: Arc<dyn Registry>,
    storage_mode: StorageMode,
    github_api_base: Option<String>,
) -> TestServer {
    let mut state = GatewayState::new(
        DockyardConfig::default(),
        Arc::clone(&registry),
        storage_mode,
        ProviderSet::new(),
        None,
        None,
        Arc::new(TransportManager::new(Default::default())),
    );
    state.github_api_base = github_api_base;
    let state = Arc::new(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let router = build_router(Arc::clone(&state));
    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await
            .unwrap();
    });

    TestServer {
        base_url: format!("http://127.0.0.1:{port}"),
        registry,
        _shutdown: shutdown,
    }
}

async fn spawn_gateway() -> TestServer {
    spawn_gateway_with_registry(Arc::new(MemoryRegistry::new()), StorageMode::Memory, None).await
}

async fn seed_linked_user(registry: &Arc<dyn Registry>, username: &str) -> User {
    let user = User::new(username, "ssh-ed25519 AAAA...");
    registry.register_user(user.clone()).await.unwrap();
    let now = Utc::now();
    registry
        .upsert_installation(GithubInstallation {
            id: format!("oauth:{}", 12345),
            user_id: user.id.clone(),
            account_id: 12345,
            account_login: username.to_string(),
            access_token: Secret::new("ghs_testtoken".into()),
            token_expires_at: now + Duration::hours(1),
            repository_scope: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    user
}

// ── Fake node agent ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct FakeAgentState {
    gateway_url: String,
    node_id: String,
    ssh_port: u16,
}

async fn fake_agent_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn fake_agent_command(
    State(agent): State<FakeAgentState>,
    Json(command): Json<Command>,
) -> (StatusCode, Json<CommandResult>) {
    let ack = CommandResult {
        command_id: command.id.clone(),
        node_id: agent.node_id.clone(),
        status: CommandStatus::Running,
        output: String::new(),
        error: None,
        duration_ms: 0,
        finished_at: Utc::now(),
    };

    // Complete asynchronously, like a real agent's queue worker.
    tokio::spawn(async move {
        let output = match command.action {
            dockyard_protocol::CommandAction::Create => serde_json::to_string(&SessionCreated {
                ssh_port: agent.ssh_port,
                services: HashMap::from([("web".to_string(), 5000u16)]),
            })
            .unwrap(),
            dockyard_protocol::CommandAction::Status => {
                serde_json::to_string(&dockyard_providers::Session {
                    id: format!(
                        "dockyard-{}",
                        command.session_id.as_deref().unwrap_or_default()
                    ),
                    provider: "lxc".into(),
                    status: dockyard_providers::SessionStatus::Running,
                    ssh_port: agent.ssh_port,
                    services: HashMap::from([("web".to_string(), 5000u16)]),
                    labels: HashMap::new(),
                })
                .unwrap()
            },
            _ => String::new(),
        };
        let result = CommandResult::success(&command.id, &agent.node_id, output);
        let url = format!(
            "{}/api/v1/commands/{}/result",
            agent.gateway_url, command.id
        );
        let _ = reqwest::Client::new().post(&url).json(&result).send().await;
    });

    (StatusCode::ACCEPTED, Json(ack))
}

/// Bind a fake agent and register it with the gateway as an lxc-capable
/// node. Returns the node id.
async fn register_fake_agent(server: &TestServer, node_id: &str) -> String {
    let agent_state = FakeAgentState {
        gateway_url: server.base_url.clone(),
        node_id: node_id.to_string(),
        ssh_port: 32801,
    };
    let router = Router::new()
        .route("/health", get(fake_agent_health))
        .route("/api/v1/agent/commands", post(fake_agent_command))
        .with_state(agent_state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let registration = NodeRegistration {
        id: node_id.to_string(),
        name: node_id.to_string(),
        host: "127.0.0.1".into(),
        port,
        capabilities: vec!["lxc".into()],
        labels: HashMap::new(),
        metadata: HashMap::new(),
        version: "0.4.2".into(),
        recovered_sessions: vec![],
    };
    let resp = reqwest::Client::new()
        .post(format!("{}/api/v1/nodes", server.base_url))
        .json(&registration)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    node_id.to_string()
}

fn create_request_body(workspace_name: &str) -> serde_json::Value {
    serde_json::json!({
        "githubUsername": "alice",
        "workspaceName": workspace_name,
        "repo": {
            "owner": "oursky",
            "name": "epson-eshop",
            "url": "https://github.com/oursky/epson-eshop.git",
            "branch": "main",
            "private": true
        },
        "provider": "lxc",
        "image": "ubuntu:22.04",
        "services": [
            {"name": "web", "command": "bundle exec puma -p 5000", "port": 5000}
        ]
    })
}

async fn github_fork_fixture(server: &mut mockito::Server) {
    server
        .mock("GET", "/user")
        .with_status(200)
        .with_body(r#"{"login":"alice"}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/repos/alice/epson-eshop")
        .with_status(404)
        .with_body(r#"{"message":"Not Found"}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/repos/oursky/epson-eshop/forks")
        .with_status(202)
        .with_body(
            r#"{
                "name": "epson-eshop",
                "full_name": "alice/epson-eshop",
                "owner": {"login": "alice"},
                "fork": true,
                "clone_url": "https://github.com/alice/epson-eshop.git"
            }"#,
        )
        .create_async()
        .await;
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_storage_mode() {
    let server = spawn_gateway().await;
    let health: serde_json::Value = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["storage"], "memory");
    assert_eq!(health["workspaces"], 0);
}

#[tokio::test]
async fn user_registration_roundtrip() {
    let server = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/v1/users/register", server.base_url))
        .json(&serde_json::json!({"username": "alice", "publicKey": "ssh-ed25519 AAAA..."}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    let user_id = body["userId"].as_str().unwrap();

    let user = server.registry.get_user(user_id).await.unwrap().unwrap();
    assert_eq!(user.username, "alice");
    assert_eq!(user.public_key, "ssh-ed25519 AAAA...");

    // Same username again conflicts.
    let resp = client
        .post(format!("{}/api/v1/users/register", server.base_url))
        .json(&serde_json::json!({"username": "alice", "publicKey": "k2"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn register_github_is_idempotent() {
    let server = spawn_gateway().await;
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "githubUsername": "alice",
        "githubId": 12345,
        "sshPubkey": "ssh-ed25519 AAAA...",
        "sshPubkeyFingerprint": "SHA256:abc"
    });

    let first = client
        .post(format!("{}/api/v1/users/register-github", server.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);
    let first: serde_json::Value = first.json().await.unwrap();

    let second = client
        .post(format!("{}/api/v1/users/register-github", server.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let second: serde_json::Value = second.json().await.unwrap();
    assert_eq!(first["userId"], second["userId"]);
}

#[tokio::test]
async fn create_without_installation_is_auth_required() {
    let server = spawn_gateway().await;
    register_fake_agent(&server, "node-1").await;

    let resp = reqwest::Client::new()
        .post(format!(
            "{}/api/v1/workspaces/create-from-repo",
            server.base_url
        ))
        .json(&serde_json::json!({
            "githubUsername": "bob",
            "workspaceName": "feature-x",
            "repo": {"owner": "oursky", "name": "epson-eshop",
                     "url": "https://github.com/oursky/epson-eshop.git"},
            "provider": "lxc",
            "image": "ubuntu:22.04"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "auth_required");
    assert!(!body["details"]["githubAuthURL"].as_str().unwrap().is_empty());

    // No workspace record was created.
    assert!(server.registry.list_workspaces().await.unwrap().is_empty());
}

#[tokio::test]
async fn workspace_name_bounds_are_enforced() {
    let server = spawn_gateway().await;
    seed_linked_user(&server.registry, "alice").await;
    register_fake_agent(&server, "node-1").await;
    let client = reqwest::Client::new();

    for bad in ["", &"a".repeat(65), "Has-Caps"] {
        let mut body = create_request_body("x");
        body["workspaceName"] = serde_json::json!(bad);
        let resp = client
            .post(format!(
                "{}/api/v1/workspaces/create-from-repo",
                server.base_url
            ))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "name {bad:?} should be rejected");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "invalid_request");
    }
}

#[tokio::test]
async fn unknown_provider_lists_availables() {
    let server = spawn_gateway().await;
    seed_linked_user(&server.registry, "alice").await;
    register_fake_agent(&server, "node-1").await;

    let mut body = create_request_body("feature-x");
    body["provider"] = serde_json::json!("firecracker");
    let resp = reqwest::Client::new()
        .post(format!(
            "{}/api/v1/workspaces/create-from-repo",
            server.base_url
        ))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_provider");
    assert_eq!(body["details"]["availableProviders"], serde_json::json!(["lxc"]));
}

#[tokio::test]
async fn happy_fork_path_provisions_and_persists_fork() {
    let mut github = mockito::Server::new_async().await;
    github_fork_fixture(&mut github).await;

    let server = spawn_gateway_with_registry(
        Arc::new(MemoryRegistry::new()),
        StorageMode::Memory,
        Some(github.url()),
    )
    .await;
    let user = seed_linked_user(&server.registry, "alice").await;
    register_fake_agent(&server, "node-1").await;

    let resp = reqwest::Client::new()
        .post(format!(
            "{}/api/v1/workspaces/create-from-repo",
            server.base_url
        ))
        .json(&create_request_body("feature-x"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "running");
    assert_eq!(body["forkCreated"], true);
    assert_eq!(
        body["forkURL"],
        "https://github.com/alice/epson-eshop.git"
    );
    assert_eq!(body["sshPort"], 32801);
    assert_eq!(body["services"]["web"], 5000);

    // Fork record persisted for the triple.
    let fork = server
        .registry
        .get_fork(&user.id, "oursky", "epson-eshop")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fork.fork_url, "https://github.com/alice/epson-eshop.git");

    // Workspace is running with a node assigned.
    let workspaces = server.registry.list_workspaces().await.unwrap();
    assert_eq!(workspaces.len(), 1);
    assert_eq!(workspaces[0].status.to_string(), "running");
    assert_eq!(workspaces[0].node_id.as_deref(), Some("node-1"));
    assert!(workspaces[0].ssh_port > 0);

    // Duplicate name is a conflict.
    let resp = reqwest::Client::new()
        .post(format!(
            "{}/api/v1/workspaces/create-from-repo",
            server.base_url
        ))
        .json(&create_request_body("feature-x"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "workspace_exists");
    assert_eq!(body["details"]["workspaceName"], "feature-x");

    // Second workspace against the same repo reuses the stored fork
    // record instead of calling GitHub again.
    let resp = reqwest::Client::new()
        .post(format!(
            "{}/api/v1/workspaces/create-from-repo",
            server.base_url
        ))
        .json(&create_request_body("feature-y"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["forkCreated"], true);
    assert_eq!(body["forkURL"], "https://github.com/alice/epson-eshop.git");
}

#[tokio::test]
async fn stop_and_delete_transition_the_workspace() {
    let server = spawn_gateway().await;
    seed_linked_user(&server.registry, "alice").await;
    register_fake_agent(&server, "node-1").await;

    let mut body = create_request_body("feature-x");
    // Public repo, no fork needed.
    body["repo"]["private"] = serde_json::json!(false);
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "{}/api/v1/workspaces/create-from-repo",
            server.base_url
        ))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = resp.json().await.unwrap();
    let id = created["workspaceId"].as_str().unwrap();

    let resp = client
        .post(format!("{}/api/v1/workspaces/{id}/stop", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "stopped");

    let ws = server.registry.get_workspace(id).await.unwrap().unwrap();
    assert_eq!(ws.ssh_port, 0, "ssh port must be zero unless running");

    let resp = client
        .delete(format!("{}/api/v1/workspaces/{id}", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "deleted");

    // Deleted workspaces drop out of the listing.
    let listing: serde_json::Value = client
        .get(format!("{}/api/v1/workspaces", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["workspaces"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn stopped_workspace_can_be_started_again() {
    let server = spawn_gateway().await;
    seed_linked_user(&server.registry, "alice").await;
    register_fake_agent(&server, "node-1").await;
    let client = reqwest::Client::new();

    let mut body = create_request_body("feature-x");
    body["repo"]["private"] = serde_json::json!(false);
    let resp = client
        .post(format!(
            "{}/api/v1/workspaces/create-from-repo",
            server.base_url
        ))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = resp.json().await.unwrap();
    let id = created["workspaceId"].as_str().unwrap();

    let resp = client
        .post(format!("{}/api/v1/workspaces/{id}/stop", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{}/api/v1/workspaces/{id}/start", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "running");

    // The re-attached workspace reads its ports back from the node.
    let ws = server.registry.get_workspace(id).await.unwrap().unwrap();
    assert_eq!(ws.ssh_port, 32801);
    assert_eq!(ws.service_ports.get("web"), Some(&5000));
}

#[tokio::test]
async fn heartbeat_restores_an_offline_node() {
    let server = spawn_gateway().await;
    register_fake_agent(&server, "node-1").await;
    let client = reqwest::Client::new();

    // Force the node offline as the sweep would.
    let mut node = server.registry.get_node("node-1").await.unwrap().unwrap();
    node.status = NodeStatus::Offline;
    server.registry.upsert_node(node).await.unwrap();

    let beat = HeartbeatRequest {
        last_seen: Utc::now(),
        status: NodeStatus::Offline,
        services: HashMap::new(),
    };
    let resp = client
        .post(format!(
            "{}/api/v1/nodes/node-1/heartbeat",
            server.base_url
        ))
        .json(&beat)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let node = server.registry.get_node("node-1").await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Active);

    // Heartbeats from unregistered nodes are rejected.
    let resp = client
        .post(format!("{}/api/v1/nodes/ghost/heartbeat", server.base_url))
        .json(&beat)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn late_command_results_are_accepted_and_dropped() {
    let server = spawn_gateway().await;
    let result = CommandResult::success("nobody-waits", "node-1", "output");
    let resp = reqwest::Client::new()
        .post(format!(
            "{}/api/v1/commands/nobody-waits/result",
            server.base_url
        ))
        .json(&result)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
}

#[tokio::test]
async fn workspaces_survive_a_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("core.db");

    let registry: Arc<dyn Registry> =
        Arc::new(SqliteRegistry::open(&db_path).await.unwrap());
    let server = spawn_gateway_with_registry(registry, StorageMode::Sqlite, None).await;
    seed_linked_user(&server.registry, "alice").await;
    register_fake_agent(&server, "node-1").await;

    let mut body = create_request_body("feature-x");
    body["repo"]["private"] = serde_json::json!(false);
    let resp = reqwest::Client::new()
        .post(format!(
            "{}/api/v1/workspaces/create-from-repo",
            server.base_url
        ))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = resp.json().await.unwrap();
    let id = created["workspaceId"].as_str().unwrap().to_string();
    drop(server);

    // A new process over the same database sees the same workspace.
    let registry: Arc<dyn Registry> =
        Arc::new(SqliteRegistry::open(&db_path).await.unwrap());
    let server = spawn_gateway_with_registry(registry, StorageMode::Sqlite, None).await;
    let listing: serde_json::Value = reqwest::get(format!("{}/api/v1/workspaces", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workspaces = listing["workspaces"].as_array().unwrap();
    assert_eq!(workspaces.len(), 1);
    assert_eq!(workspaces[0]["id"], id.as_str());
    assert!(matches!(
        workspaces[0]["status"].as_str().unwrap(),
        "running" | "stopped" | "failed"
    ));

    let health: serde_json::Value = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["storage"], "sqlite");
}
