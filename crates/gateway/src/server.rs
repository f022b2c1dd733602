//! Router assembly and server lifecycle.

use std::sync::Arc;

use {
    axum::{
        Router,
        http::header,
        routing::{delete, get, post},
    },
    chrono::Utc,
    tokio_util::sync::CancellationToken,
    tower_http::{
        catch_panic::CatchPanicLayer,
        cors::CorsLayer,
        request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
        sensitive_headers::SetSensitiveHeadersLayer,
        trace::TraceLayer,
    },
    tracing::info,
};

use {
    crate::{
        auth_routes, commands, health, nodes,
        state::{AppState, LOCAL_NODE_LABEL},
        sweep, users, workspaces,
    },
    dockyard_protocol::NodeStatus,
    dockyard_registry::{Node, Registry as _},
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/auth/github/callback", get(auth_routes::callback).post(auth_routes::callback))
        .route("/auth/success", get(auth_routes::success))
        .route("/api/v1/users/register", post(users::register))
        .route("/api/v1/users/register-github", post(users::register_github))
        .route(
            "/api/v1/workspaces/create-from-repo",
            post(workspaces::create_from_repo),
        )
        .route("/api/v1/workspaces", get(workspaces::list))
        .route("/api/v1/workspaces/{id}/status", get(workspaces::status))
        .route("/api/v1/workspaces/{id}/stop", post(workspaces::stop))
        .route("/api/v1/workspaces/{id}/start", post(workspaces::start))
        .route("/api/v1/workspaces/{id}", delete(workspaces::destroy))
        .route("/api/v1/nodes", post(nodes::register).get(nodes::list))
        .route("/api/v1/nodes/{id}/heartbeat", post(nodes::heartbeat))
        .route("/api/v1/nodes/{id}", delete(nodes::deregister))
        .route("/api/v1/commands/{id}/result", post(commands::submit_result))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION]))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Record the server host itself as a node when it carries usable
/// providers, so scheduling can prefer it without a separate agent.
pub async fn register_local_node(state: &AppState) {
    let availability = state.providers.availability().await;
    let capabilities: Vec<String> = availability
        .iter()
        .filter(|(_, up)| **up)
        .map(|(name, _)| name.clone())
        .collect();
    if capabilities.is_empty() {
        info!("no local providers available; all work will dispatch to agents");
        return;
    }

    let node = Node {
        id: state.local_node_id.clone(),
        name: state.local_node_id.clone(),
        host: "127.0.0.1".into(),
        port: state.config.server.port,
        status: NodeStatus::Active,
        version: env!("CARGO_PKG_VERSION").into(),
        last_seen: Utc::now(),
        capabilities: capabilities.clone(),
        labels: std::collections::HashMap::from([(
            LOCAL_NODE_LABEL.to_string(),
            "true".to_string(),
        )]),
        metadata: std::collections::HashMap::new(),
    };
    if let Err(e) = state.registry.upsert_node(node).await {
        tracing::warn!(error = %e, "could not register the local node");
    } else {
        info!(node = %state.local_node_id, ?capabilities, "local node registered");
    }
}

/// Bind, print the startup banner, spawn the sweep, and serve until the
/// shutdown token fires. Close-down drains the transport pools.
pub async fn run(state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    register_local_node(&state).await;

    let addr = format!("{}:{}", state.config.server.bind, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // The banner is the operator's cue that a fallback store is in use.
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        storage = %state.storage_mode,
        providers = ?state.providers.names(),
        "dockyard coordination server up"
    );

    let sweeper = tokio::spawn(sweep::run(Arc::clone(&state), shutdown.clone()));

    let router = build_router(Arc::clone(&state));
    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await?;

    let _ = sweeper.await;
    state.transports.close_all().await;
    info!("server stopped");
    Ok(())
}
