//! Registry entities. Invariants that span fields (node assignment while
//! live, fork URL when fork-created) are enforced by the coordination core
//! at transition time; the registry stores what it is given.

use std::collections::HashMap;

use {
    chrono::{DateTime, Utc},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use dockyard_protocol::{NodeStatus, ServiceSpec, WorkspaceStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Unique among users.
    pub username: String,
    /// Public key material for interactive shell access.
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, public_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("u_{}", uuid::Uuid::new_v4()),
            username: username.into(),
            public_key: public_key.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A user's authorized linkage to the GitHub App. At most one per user;
/// the token is secret-at-rest and never appears in logs.
#[derive(Clone)]
pub struct GithubInstallation {
    pub id: String,
    pub user_id: String,
    /// Upstream numeric account id.
    pub account_id: i64,
    /// Upstream account login; fork owners equal this.
    pub account_login: String,
    /// Short-lived access token (≤1 hour TTL).
    pub access_token: Secret<String>,
    pub token_expires_at: DateTime<Utc>,
    pub repository_scope: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GithubInstallation {
    /// Seconds until the token expires; negative when already expired.
    pub fn token_ttl_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.token_expires_at - now).num_seconds()
    }

    pub fn token(&self) -> &str {
        self.access_token.expose_secret()
    }
}

impl std::fmt::Debug for GithubInstallation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubInstallation")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("account_id", &self.account_id)
            .field("account_login", &self.account_login)
            .field("access_token", &"[REDACTED]")
            .field("token_expires_at", &self.token_expires_at)
            .field("repository_scope", &self.repository_scope)
            .finish()
    }
}

/// A user-owned fork of an upstream repository, created on demand so writes
/// never touch the upstream. Unique per (user, original owner, original repo).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GithubFork {
    pub user_id: String,
    pub original_owner: String,
    pub original_repo: String,
    pub fork_owner: String,
    pub fork_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub version: String,
    pub last_seen: DateTime<Utc>,
    /// Provider names this node can run.
    pub capabilities: Vec<String>,
    pub labels: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn has_capability(&self, provider: &str) -> bool {
        self.capabilities.iter().any(|c| c == provider)
    }
}

/// Repository coordinates carried by a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRepo {
    pub owner: String,
    pub name: String,
    pub url: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: WorkspaceStatus,
    pub provider: String,
    pub image: String,
    pub repo: WorkspaceRepo,
    pub fork_created: bool,
    pub fork_url: Option<String>,
    pub ssh_host: Option<String>,
    /// Non-zero only while running.
    pub ssh_port: u16,
    /// Exactly one node assigned while pending/provisioning/running.
    pub node_id: Option<String>,
    pub services: Vec<ServiceSpec>,
    pub service_ports: HashMap<String, u16>,
    /// Failure reason, set on transition to `failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn summary(&self) -> dockyard_protocol::WorkspaceSummary {
        dockyard_protocol::WorkspaceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            provider: self.provider.clone(),
            ssh_port: self.ssh_port,
            services: self.service_ports.clone(),
        }
    }
}
