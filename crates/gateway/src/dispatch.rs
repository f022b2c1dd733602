//! Command dispatch to nodes.
//!
//! A command for the server host runs through the local executor; a
//! command for a remote node goes over the node's HTTP transport (pooled
//! through the transport manager) and the real result is awaited from the
//! pending-result table, reconciled by command id whatever order agents
//! report in.

use std::time::Duration;

use {axum::http::StatusCode, tracing::{debug, warn}};

use {
    crate::{
        error::{ApiError, ApiResult},
        state::{AppState, LOCAL_NODE_LABEL},
    },
    dockyard_protocol::{Command, CommandResult, CommandStatus, error_codes},
    dockyard_registry::Node,
    dockyard_transport::{HttpAuth, Transport as _, TransportConfig},
};

fn transport_name(node_id: &str) -> String {
    format!("node:{node_id}")
}

/// Make sure the manager holds an HTTP transport config for this node.
pub async fn ensure_node_transport(state: &AppState, node: &Node) -> ApiResult<()> {
    let name = transport_name(&node.id);
    let config = TransportConfig::Http {
        base_url: format!("http://{}:{}", node.host, node.port),
        auth: HttpAuth::None,
        verify_tls: true,
        ca_path: None,
    };
    if state.transports.get(&name).await.as_ref() == Some(&config) {
        return Ok(());
    }
    state.transports.register(name, config).await?;
    Ok(())
}

pub fn is_local_node(node: &Node) -> bool {
    node.labels.get(LOCAL_NODE_LABEL).map(String::as_str) == Some("true")
}

/// Send `command` to `node` and wait for its completed result, bounded by
/// the command's own timeout.
pub async fn dispatch_and_wait(
    state: &AppState,
    node: &Node,
    command: Command,
) -> ApiResult<CommandResult> {
    if is_local_node(node) {
        debug!(command = %command.id, "executing on the server host");
        return Ok(state.local_executor.execute(&command).await);
    }

    ensure_node_transport(state, node).await?;
    let pool = state.transports.pool(&transport_name(&node.id)).await?;

    let timeout = Duration::from_secs(command.timeout_secs);
    let waiter = state.register_pending(&command.id);

    let ack = async {
        let conn = pool.acquire().await?;
        conn.execute(&command).await
    }
    .await;

    let ack = match ack {
        Ok(ack) => ack,
        Err(e) => {
            state.abandon_pending(&command.id);
            return Err(e.into());
        },
    };

    // An agent may answer inline instead of deferring to the result
    // endpoint; a terminal ack is already the result.
    if ack.status != CommandStatus::Running {
        state.abandon_pending(&command.id);
        return Ok(ack);
    }

    match tokio::time::timeout(timeout, waiter).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(_)) => {
            state.abandon_pending(&command.id);
            Err(ApiError::internal("result channel dropped"))
        },
        Err(_) => {
            state.abandon_pending(&command.id);
            warn!(command = %command.id, node = %node.id, "timed out waiting for result");
            Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                error_codes::INSUFFICIENT_RESOURCES,
                "node did not report a result in time; retry later",
            ))
        },
    }
}

/// Fire a command without waiting (best-effort cleanup paths).
pub async fn dispatch_forget(state: &AppState, node: &Node, command: Command) {
    if is_local_node(node) {
        let _ = state.local_executor.execute(&command).await;
        return;
    }
    if ensure_node_transport(state, node).await.is_err() {
        return;
    }
    if let Ok(pool) = state.transports.pool(&transport_name(&node.id)).await
        && let Ok(conn) = pool.acquire().await
        && let Err(e) = conn.execute(&command).await
    {
        debug!(command = %command.id, node = %node.id, error = %e, "best-effort dispatch failed");
    }
}
