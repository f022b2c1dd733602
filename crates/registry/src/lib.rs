//! Durable, restart-surviving state for users, GitHub installations, fork
//! mappings, nodes, and workspaces.
//!
//! Two interchangeable variants sit behind the [`Registry`] trait: an
//! in-memory store (process lifetime, used when no `DB_PATH` is configured
//! and in tests) and a SQLite store with versioned migrations, WAL, and
//! upsert semantics so the provisioning pipeline can retry safely.

pub mod error;
pub mod memory;
pub mod model;
pub mod sqlite;

use std::{path::Path, sync::Arc};

use {async_trait::async_trait, tracing::warn};

pub use {
    error::{Error, Result},
    memory::MemoryRegistry,
    model::{GithubFork, GithubInstallation, Node, Workspace, WorkspaceRepo},
    sqlite::SqliteRegistry,
};

/// Which backing store a registry handle is using. Reported by `/health`
/// and the startup banner so an unintentional fallback is observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Memory,
    Sqlite,
    /// SQLite was requested but could not be opened.
    MemoryFallback,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::Memory => f.write_str("memory"),
            StorageMode::Sqlite => f.write_str("sqlite"),
            StorageMode::MemoryFallback => f.write_str("memory (fallback)"),
        }
    }
}

/// Capability set shared by both storage variants.
///
/// All operations take `&self`; implementations handle their own locking.
#[async_trait]
pub trait Registry: Send + Sync {
    // ── Users ──
    async fn register_user(&self, user: model::User) -> Result<()>;
    async fn get_user(&self, id: &str) -> Result<Option<model::User>>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<model::User>>;
    async fn list_users(&self) -> Result<Vec<model::User>>;
    async fn remove_user(&self, id: &str) -> Result<()>;

    // ── GitHub installations (at most one per user) ──
    async fn upsert_installation(&self, installation: GithubInstallation) -> Result<()>;
    async fn get_installation_by_user(&self, user_id: &str)
    -> Result<Option<GithubInstallation>>;
    async fn delete_installation_by_user(&self, user_id: &str) -> Result<()>;

    // ── Forks (unique per (user, original owner, original repo)) ──
    async fn upsert_fork(&self, fork: GithubFork) -> Result<()>;
    async fn get_fork(
        &self,
        user_id: &str,
        original_owner: &str,
        original_repo: &str,
    ) -> Result<Option<GithubFork>>;

    // ── Workspaces ──
    async fn create_workspace(&self, workspace: Workspace) -> Result<()>;
    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>>;
    async fn get_workspace_by_name(&self, user_id: &str, name: &str)
    -> Result<Option<Workspace>>;
    /// All workspaces except terminal `deleted` ones.
    async fn list_workspaces(&self) -> Result<Vec<Workspace>>;
    async fn list_workspaces_by_node(&self, node_id: &str) -> Result<Vec<Workspace>>;
    async fn update_workspace(&self, workspace: Workspace) -> Result<()>;

    // ── Nodes ──
    async fn upsert_node(&self, node: Node) -> Result<()>;
    async fn get_node(&self, id: &str) -> Result<Option<Node>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn remove_node(&self, id: &str) -> Result<()>;
    async fn list_nodes_by_capability(&self, capability: &str) -> Result<Vec<Node>>;
    async fn list_nodes_by_label(&self, key: &str, value: &str) -> Result<Vec<Node>>;
}

/// Open the configured registry, falling back to memory when the SQLite
/// store cannot be opened. The fallback is deliberate deployment policy;
/// callers surface the returned [`StorageMode`] in `/health` and the
/// startup banner.
pub async fn open_with_fallback(
    db_path: Option<&Path>,
) -> (Arc<dyn Registry>, StorageMode) {
    match db_path {
        None => (Arc::new(MemoryRegistry::new()), StorageMode::Memory),
        Some(path) => match SqliteRegistry::open(path).await {
            Ok(registry) => (Arc::new(registry), StorageMode::Sqlite),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to open sqlite registry, falling back to in-memory store"
                );
                (Arc::new(MemoryRegistry::new()), StorageMode::MemoryFallback)
            },
        },
    }
}
