//! In-memory registry. Process-lifetime only; used when no database path is
//! configured and throughout the test suites.

use std::collections::HashMap;

use {async_trait::async_trait, tokio::sync::RwLock};

use crate::{
    Error, Result,
    model::{GithubFork, GithubInstallation, Node, User, Workspace},
};

use dockyard_protocol::WorkspaceStatus;

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    /// user id → installation (at most one per user).
    installations: HashMap<String, GithubInstallation>,
    /// (user id, original owner, original repo) → fork.
    forks: HashMap<(String, String, String), GithubFork>,
    workspaces: HashMap<String, Workspace>,
    nodes: HashMap<String, Node>,
}

/// All operations go through a single read-write lock; list operations
/// return snapshot copies.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: RwLock<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::Registry for MemoryRegistry {
    async fn register_user(&self, user: User) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner
            .users
            .values()
            .any(|u| u.username == user.username && u.id != user.id)
        {
            return Err(Error::conflict(format!(
                "username already registered: {}",
                user.username
            )));
        }
        inner.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.inner.read().await.users.values().cloned().collect())
    }

    async fn remove_user(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.users.remove(id);
        inner.installations.remove(id);
        Ok(())
    }

    async fn upsert_installation(&self, installation: GithubInstallation) -> Result<()> {
        self.inner
            .write()
            .await
            .installations
            .insert(installation.user_id.clone(), installation);
        Ok(())
    }

    async fn get_installation_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<GithubInstallation>> {
        Ok(self.inner.read().await.installations.get(user_id).cloned())
    }

    async fn delete_installation_by_user(&self, user_id: &str) -> Result<()> {
        self.inner.write().await.installations.remove(user_id);
        Ok(())
    }

    async fn upsert_fork(&self, fork: GithubFork) -> Result<()> {
        let key = (
            fork.user_id.clone(),
            fork.original_owner.clone(),
            fork.original_repo.clone(),
        );
        self.inner.write().await.forks.insert(key, fork);
        Ok(())
    }

    async fn get_fork(
        &self,
        user_id: &str,
        original_owner: &str,
        original_repo: &str,
    ) -> Result<Option<GithubFork>> {
        let key = (
            user_id.to_string(),
            original_owner.to_string(),
            original_repo.to_string(),
        );
        Ok(self.inner.read().await.forks.get(&key).cloned())
    }

    async fn create_workspace(&self, workspace: Workspace) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.workspaces.contains_key(&workspace.id) {
            return Err(Error::conflict(format!(
                "workspace id already exists: {}",
                workspace.id
            )));
        }
        inner.workspaces.insert(workspace.id.clone(), workspace);
        Ok(())
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        Ok(self.inner.read().await.workspaces.get(id).cloned())
    }

    async fn get_workspace_by_name(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Option<Workspace>> {
        Ok(self
            .inner
            .read()
            .await
            .workspaces
            .values()
            .find(|w| w.user_id == user_id && w.name == name && w.status != WorkspaceStatus::Deleted)
            .cloned())
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        Ok(self
            .inner
            .read()
            .await
            .workspaces
            .values()
            .filter(|w| w.status != WorkspaceStatus::Deleted)
            .cloned()
            .collect())
    }

    async fn list_workspaces_by_node(&self, node_id: &str) -> Result<Vec<Workspace>> {
        Ok(self
            .inner
            .read()
            .await
            .workspaces
            .values()
            .filter(|w| w.node_id.as_deref() == Some(node_id))
            .cloned()
            .collect())
    }

    async fn update_workspace(&self, workspace: Workspace) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.workspaces.contains_key(&workspace.id) {
            return Err(Error::not_found("workspace", &workspace.id));
        }
        inner.workspaces.insert(workspace.id.clone(), workspace);
        Ok(())
    }

    async fn upsert_node(&self, node: Node) -> Result<()> {
        self.inner.write().await.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.inner.read().await.nodes.get(id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.inner.read().await.nodes.values().cloned().collect())
    }

    async fn remove_node(&self, id: &str) -> Result<()> {
        self.inner.write().await.nodes.remove(id);
        Ok(())
    }

    async fn list_nodes_by_capability(&self, capability: &str) -> Result<Vec<Node>> {
        Ok(self
            .inner
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.has_capability(capability))
            .cloned()
            .collect())
    }

    async fn list_nodes_by_label(&self, key: &str, value: &str) -> Result<Vec<Node>> {
        Ok(self
            .inner
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.labels.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }
}
