//! Heartbeat sweep.
//!
//! Nodes silent for N consecutive heartbeat intervals go offline, and any
//! of their live workspaces fail with reason `node_unreachable` so nothing
//! dangles on a vanished host. The server host's own node record is
//! self-heartbeated here instead.

use {chrono::Utc, tokio_util::sync::CancellationToken, tracing::{info, warn}};

use {
    crate::{dispatch::is_local_node, state::AppState},
    dockyard_protocol::{NodeStatus, WorkspaceStatus},
    dockyard_registry::Registry as _,
};

/// One pass over every node. Separated from the loop for tests.
pub async fn sweep_once(state: &AppState) {
    let max_silence_secs =
        (state.config.agent.heartbeat_secs * state.config.agent.max_missed_heartbeats as u64) as i64;
    let now = Utc::now();

    let nodes = match state.registry.list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "sweep could not list nodes");
            return;
        },
    };

    for mut node in nodes {
        if is_local_node(&node) {
            node.last_seen = now;
            node.status = NodeStatus::Active;
            if let Err(e) = state.registry.upsert_node(node).await {
                warn!(error = %e, "local node self-heartbeat failed");
            }
            continue;
        }

        let silent_for = (now - node.last_seen).num_seconds();
        let already_down = matches!(node.status, NodeStatus::Offline | NodeStatus::Stopped);
        if silent_for <= max_silence_secs || already_down {
            continue;
        }

        info!(node = %node.id, silent_for, "node missed heartbeats, marking offline");
        node.status = NodeStatus::Offline;
        let node_id = node.id.clone();
        if let Err(e) = state.registry.upsert_node(node).await {
            warn!(node = %node_id, error = %e, "failed to mark node offline");
            continue;
        }

        fail_node_workspaces(state, &node_id).await;
    }
}

async fn fail_node_workspaces(state: &AppState, node_id: &str) {
    let workspaces = match state.registry.list_workspaces_by_node(node_id).await {
        Ok(workspaces) => workspaces,
        Err(e) => {
            warn!(node = node_id, error = %e, "sweep could not list node workspaces");
            return;
        },
    };
    for mut workspace in workspaces {
        if !matches!(
            workspace.status,
            WorkspaceStatus::Provisioning | WorkspaceStatus::Running
        ) {
            continue;
        }
        warn!(workspace = %workspace.id, node = node_id, "failing workspace: node unreachable");
        workspace.status = WorkspaceStatus::Failed;
        workspace.error = Some("node_unreachable".into());
        workspace.ssh_port = 0;
        workspace.updated_at = Utc::now();
        if let Err(e) = state.registry.update_workspace(workspace).await {
            warn!(error = %e, "failed to fail workspace during sweep");
        }
    }
}

/// Run the sweep on the heartbeat interval until cancelled.
pub async fn run(state: AppState, shutdown: CancellationToken) {
    let mut tick =
        tokio::time::interval(std::time::Duration::from_secs(state.config.agent.heartbeat_secs));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.cancelled() => break,
        }
        sweep_once(&state).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::state::{GatewayState, LOCAL_NODE_LABEL},
        chrono::Duration,
        dockyard_common::DockyardConfig,
        dockyard_providers::ProviderSet,
        dockyard_registry::{
            MemoryRegistry, Node, Registry, StorageMode, Workspace, WorkspaceRepo,
        },
        dockyard_transport::TransportManager,
        std::{collections::HashMap, sync::Arc},
    };

    fn node(id: &str, silent_secs: i64, local: bool) -> Node {
        let mut labels = HashMap::new();
        if local {
            labels.insert(LOCAL_NODE_LABEL.to_string(), "true".to_string());
        }
        Node {
            id: id.into(),
            name: id.into(),
            host: "10.0.0.5".into(),
            port: 3002,
            status: NodeStatus::Active,
            version: "0.4.2".into(),
            last_seen: Utc::now() - Duration::seconds(silent_secs),
            capabilities: vec!["lxc".into()],
            labels,
            metadata: HashMap::new(),
        }
    }

    fn running_workspace(id: &str, node_id: &str) -> Workspace {
        Workspace {
            id: id.into(),
            user_id: "u_1".into(),
            name: id.into(),
            status: WorkspaceStatus::Running,
            provider: "lxc".into(),
            image: "ubuntu:22.04".into(),
            repo: WorkspaceRepo {
                owner: "o".into(),
                name: "r".into(),
                url: "https://github.com/o/r.git".into(),
                branch: None,
                commit: None,
            },
            fork_created: false,
            fork_url: None,
            ssh_host: Some("10.0.0.5".into()),
            ssh_port: 32801,
            node_id: Some(node_id.into()),
            services: vec![],
            service_ports: HashMap::new(),
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn state() -> AppState {
        Arc::new(GatewayState::new(
            DockyardConfig::default(),
            Arc::new(MemoryRegistry::new()),
            StorageMode::Memory,
            ProviderSet::new(),
            None,
            None,
            Arc::new(TransportManager::new(Default::default())),
        ))
    }

    #[tokio::test]
    async fn silent_node_goes_offline_and_workspaces_fail() {
        let state = state().await;
        state.registry.upsert_node(node("a", 120, false)).await.unwrap();
        state
            .registry
            .create_workspace(running_workspace("ws-1", "a"))
            .await
            .unwrap();

        sweep_once(&state).await;

        let node = state.registry.get_node("a").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Offline);

        let ws = state.registry.get_workspace("ws-1").await.unwrap().unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Failed);
        assert_eq!(ws.error.as_deref(), Some("node_unreachable"));
        assert_eq!(ws.ssh_port, 0);
    }

    #[tokio::test]
    async fn fresh_node_is_left_alone() {
        let state = state().await;
        state.registry.upsert_node(node("a", 10, false)).await.unwrap();
        sweep_once(&state).await;
        let node = state.registry.get_node("a").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Active);
    }

    #[tokio::test]
    async fn local_node_is_self_heartbeated() {
        let state = state().await;
        state.registry.upsert_node(node("local", 999, true)).await.unwrap();
        sweep_once(&state).await;
        let node = state.registry.get_node("local").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert!((Utc::now() - node.last_seen).num_seconds() < 5);
    }
}
