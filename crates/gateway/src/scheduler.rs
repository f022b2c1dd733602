//! Node selection.
//!
//! Prefer the server host when it carries the requested provider,
//! otherwise any active node whose capability map declares it. Ties break
//! on load (fewest live sessions), then lexicographic node id. Nodes whose
//! last heartbeat is stale are skipped even if the sweep has not caught
//! them yet.

use {chrono::Utc, tracing::debug};

use {
    crate::{
        error::{ApiError, ApiResult},
        state::AppState,
    },
    dockyard_protocol::{NodeStatus, WorkspaceStatus},
    dockyard_registry::{Node, Registry as _},
};

/// A node is schedulable while active or merely busy.
fn is_schedulable(node: &Node, max_silence_secs: i64) -> bool {
    matches!(node.status, NodeStatus::Active | NodeStatus::Busy)
        && (Utc::now() - node.last_seen).num_seconds() <= max_silence_secs
}

async fn live_sessions(state: &AppState, node_id: &str) -> ApiResult<usize> {
    let workspaces = state.registry.list_workspaces_by_node(node_id).await?;
    Ok(workspaces
        .iter()
        .filter(|w| {
            matches!(
                w.status,
                WorkspaceStatus::Provisioning | WorkspaceStatus::Running
            )
        })
        .count())
}

/// Pick the node that will host a new workspace for `provider`.
pub async fn select_node(state: &AppState, provider: &str) -> ApiResult<Node> {
    let max_silence =
        (state.config.agent.heartbeat_secs * state.config.agent.max_missed_heartbeats as u64)
            as i64;

    let candidates = state.registry.list_nodes_by_capability(provider).await?;
    let mut usable: Vec<Node> = candidates
        .into_iter()
        .filter(|n| is_schedulable(n, max_silence))
        .collect();

    if usable.is_empty() {
        return Err(ApiError::insufficient_resources(format!(
            "no active node carries provider '{provider}'; start an agent or free capacity"
        )));
    }

    // The server host wins outright when it qualifies.
    if let Some(local) = usable
        .iter()
        .find(|n| crate::dispatch::is_local_node(n))
        .cloned()
    {
        debug!(node = %local.id, provider, "scheduling on the server host");
        return Ok(local);
    }

    let mut best: Option<(usize, Node)> = None;
    usable.sort_by(|a, b| a.id.cmp(&b.id));
    for node in usable {
        let load = live_sessions(state, &node.id).await?;
        match &best {
            Some((best_load, _)) if *best_load <= load => {},
            _ => best = Some((load, node)),
        }
    }

    match best {
        Some((load, node)) => {
            debug!(node = %node.id, provider, load, "node selected");
            Ok(node)
        },
        None => Err(ApiError::insufficient_resources(format!(
            "no active node carries provider '{provider}'"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::state::GatewayState,
        chrono::Duration,
        dockyard_common::DockyardConfig,
        dockyard_protocol::WorkspaceStatus,
        dockyard_providers::ProviderSet,
        dockyard_registry::{
            MemoryRegistry, Registry, StorageMode, Workspace, WorkspaceRepo,
        },
        dockyard_transport::TransportManager,
        std::{collections::HashMap, sync::Arc},
    };

    fn node(id: &str, caps: &[&str], last_seen_ago_secs: i64, status: NodeStatus) -> Node {
        Node {
            id: id.into(),
            name: id.into(),
            host: "10.0.0.5".into(),
            port: 3002,
            status,
            version: "0.4.2".into(),
            last_seen: Utc::now() - Duration::seconds(last_seen_ago_secs),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            labels: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    fn workspace(id: &str, node_id: &str, status: WorkspaceStatus) -> Workspace {
        Workspace {
            id: id.into(),
            user_id: "u_1".into(),
            name: id.into(),
            status,
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
            ssh_host: None,
            ssh_port: 0,
            node_id: Some(node_id.into()),
            services: vec![],
            service_ports: HashMap::new(),
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn state_with_nodes(nodes: Vec<Node>) -> AppState {
        let registry = Arc::new(MemoryRegistry::new());
        for node in nodes {
            registry.upsert_node(node).await.unwrap();
        }
        Arc::new(GatewayState::new(
            DockyardConfig::default(),
            registry,
            StorageMode::Memory,
            ProviderSet::new(),
            None,
            None,
            Arc::new(TransportManager::new(Default::default())),
        ))
    }

    #[tokio::test]
    async fn capability_filter_excludes_wrong_provider() {
        let state = state_with_nodes(vec![node("a", &["docker"], 0, NodeStatus::Active)]).await;
        match select_node(&state, "lxc").await {
            Err(e) => assert_eq!(e.code, "insufficient_resources"),
            Ok(_) => panic!("expected no node"),
        }
    }

    #[tokio::test]
    async fn stale_node_is_skipped() {
        // Heartbeat 30s × 3 missed = 90s window; 120s silence is stale.
        let state =
            state_with_nodes(vec![node("a", &["lxc"], 120, NodeStatus::Active)]).await;
        assert!(select_node(&state, "lxc").await.is_err());
    }

    #[tokio::test]
    async fn least_loaded_wins_then_lexicographic() {
        let state = state_with_nodes(vec![
            node("b", &["lxc"], 0, NodeStatus::Active),
            node("a", &["lxc"], 0, NodeStatus::Active),
        ])
        .await;
        // Equal load: lexicographic id wins.
        assert_eq!(select_node(&state, "lxc").await.unwrap().id, "a");

        // Load "a" with a live workspace: "b" wins.
        state
            .registry
            .create_workspace(workspace("ws-1", "a", WorkspaceStatus::Running))
            .await
            .unwrap();
        assert_eq!(select_node(&state, "lxc").await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn offline_node_not_schedulable() {
        let state =
            state_with_nodes(vec![node("a", &["lxc"], 0, NodeStatus::Offline)]).await;
        assert!(select_node(&state, "lxc").await.is_err());
    }
}
