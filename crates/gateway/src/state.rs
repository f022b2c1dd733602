//! Shared gateway state.
//!
//! The registry is the only authoritative owner of workspace and node
//! state; everything here is runtime plumbing around it: the local
//! provider set, the GitHub adapter, the transport manager for reaching
//! remote agents, the pending-result table, and per-workspace locks that
//! serialize state transitions.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    dashmap::DashMap,
    tokio::sync::{Mutex, oneshot},
};

use {
    dockyard_common::DockyardConfig,
    dockyard_github::{GithubApp, OauthConfig},
    dockyard_protocol::CommandResult,
    dockyard_providers::ProviderSet,
    dockyard_registry::{Registry, StorageMode},
    dockyard_transport::TransportManager,
};

/// Identifier label marking the server host's own node record.
pub const LOCAL_NODE_LABEL: &str = "dockyard.local";

pub struct GatewayState {
    pub config: DockyardConfig,
    pub registry: Arc<dyn Registry>,
    pub storage_mode: StorageMode,
    pub providers: ProviderSet,
    pub github_app: Option<GithubApp>,
    pub oauth: Option<OauthConfig>,
    /// REST base override, pointed at a fixture server in tests.
    pub github_api_base: Option<String>,
    pub transports: Arc<TransportManager>,
    /// Command id → waiter for the agent's asynchronous result.
    pub pending_results: DashMap<String, oneshot::Sender<CommandResult>>,
    /// Per-workspace mutexes serializing full state transitions.
    workspace_locks: DashMap<String, Arc<Mutex<()>>>,
    /// The local executor used when a workspace lands on the server host.
    pub local_executor: Arc<dockyard_agent::executor::Executor>,
    pub local_node_id: String,
    pub started_at: Instant,
}

pub type AppState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(
        config: DockyardConfig,
        registry: Arc<dyn Registry>,
        storage_mode: StorageMode,
        providers: ProviderSet,
        github_app: Option<GithubApp>,
        oauth: Option<OauthConfig>,
        transports: Arc<TransportManager>,
    ) -> Self {
        let local_node_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "local".into());
        let local_executor = Arc::new(dockyard_agent::executor::Executor::new(
            local_node_id.clone(),
            providers.clone(),
            config.workspaces.root_dir.clone(),
        ));
        Self {
            config,
            registry,
            storage_mode,
            providers,
            github_app,
            oauth,
            github_api_base: None,
            transports,
            pending_results: DashMap::new(),
            workspace_locks: DashMap::new(),
            local_executor,
            local_node_id,
            started_at: Instant::now(),
        }
    }

    /// The mutex serializing operations for one workspace id. Entries are
    /// created on first use and live for the process lifetime; workspace
    /// ids are bounded by actual workspaces.
    pub fn workspace_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.workspace_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Register a waiter for a command id. The returned receiver resolves
    /// when the agent POSTs the result, however out-of-order.
    pub fn register_pending(&self, command_id: &str) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        self.pending_results.insert(command_id.to_string(), tx);
        rx
    }

    /// Resolve a pending waiter; returns false for unknown (late) results.
    pub fn resolve_pending(&self, result: CommandResult) -> bool {
        match self.pending_results.remove(&result.command_id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn abandon_pending(&self, command_id: &str) {
        self.pending_results.remove(command_id);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, dockyard_protocol::CommandResult, dockyard_registry::MemoryRegistry};

    fn state() -> GatewayState {
        GatewayState::new(
            DockyardConfig::default(),
            Arc::new(MemoryRegistry::new()),
            StorageMode::Memory,
            ProviderSet::new(),
            None,
            None,
            Arc::new(TransportManager::new(Default::default())),
        )
    }

    #[tokio::test]
    async fn pending_results_resolve_by_command_id() {
        let state = state();
        let rx = state.register_pending("c1");
        assert!(state.resolve_pending(CommandResult::success("c1", "node-1", "done")));
        let result = rx.await.unwrap();
        assert_eq!(result.output, "done");
    }

    #[tokio::test]
    async fn late_results_are_ignored() {
        let state = state();
        assert!(!state.resolve_pending(CommandResult::success("ghost", "node-1", "")));
    }

    #[tokio::test]
    async fn workspace_lock_is_shared_per_id() {
        let state = state();
        let a = state.workspace_lock("ws-1");
        let b = state.workspace_lock("ws-1");
        let guard = a.lock().await;
        assert!(b.try_lock().is_err());
        drop(guard);
        assert!(b.try_lock().is_ok());
    }
}
