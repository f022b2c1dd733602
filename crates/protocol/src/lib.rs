//! Control-plane protocol definitions shared by the server, node agents,
//! and the CLI.
//!
//! Everything on the wire is JSON:
//! - `Command` / `CommandResult` — server → agent dispatch and the
//!   asynchronous result POSTed back
//! - node registration and heartbeat payloads
//! - the public HTTP API request/response shapes

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
};

// ── Constants ────────────────────────────────────────────────────────────────

/// Default per-request timeout for HTTP handlers.
pub const HTTP_TIMEOUT_SECS: u64 = 30;
/// Upper bound for a full workspace create.
pub const WORKSPACE_CREATE_TIMEOUT_SECS: u64 = 300;
/// Upper bound for a workspace delete.
pub const WORKSPACE_DELETE_TIMEOUT_SECS: u64 = 60;
/// SSH connect timeout.
pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Default agent heartbeat interval.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Label attached to every provider session so restarts can enumerate
/// sessions owned by the coordination plane.
pub const SESSION_LABEL: &str = "dockyard.session.id";

/// Environment variable carrying the installation token inside provisioned
/// environments. Tokens are never embedded in clone URLs.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// Per-service discovery URL injected into environments as
/// `SERVICE_<UPPERNAME>_URL=http://localhost:<port>`.
pub fn service_url_env(name: &str) -> String {
    format!("SERVICE_{}_URL", name.to_uppercase().replace('-', "_"))
}

/// Parameter keys used in [`Command::params`] by the coordination server
/// and the node agents.
pub mod params {
    pub const PROVIDER: &str = "provider";
    pub const IMAGE: &str = "image";
    pub const ENV: &str = "env";
    pub const SERVICES: &str = "services";
    pub const WORKSPACE_PATH: &str = "workspacePath";
}

// ── Status enums ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Provisioning,
    Running,
    Stopped,
    Failed,
    Deleted,
}

impl WorkspaceStatus {
    /// Whether the state machine admits `self → next`.
    ///
    /// ```text
    /// pending ──create──▶ provisioning ──▶ running | failed
    /// running ──stop──▶ stopped ──start──▶ provisioning
    /// running | stopped | failed ──delete──▶ deleted (terminal)
    /// ```
    pub fn can_transition_to(self, next: WorkspaceStatus) -> bool {
        use WorkspaceStatus::*;
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Pending, Deleted)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Provisioning, Deleted)
                | (Running, Stopped)
                | (Running, Failed)
                | (Running, Deleted)
                | (Stopped, Provisioning)
                | (Stopped, Deleted)
                | (Failed, Deleted)
        )
    }

    /// States in which a node assignment must be present.
    pub fn requires_node(self) -> bool {
        matches!(
            self,
            WorkspaceStatus::Pending | WorkspaceStatus::Provisioning | WorkspaceStatus::Running
        )
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkspaceStatus::Pending => "pending",
            WorkspaceStatus::Provisioning => "provisioning",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Failed => "failed",
            WorkspaceStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkspaceStatus::Pending),
            "provisioning" => Ok(WorkspaceStatus::Provisioning),
            "running" => Ok(WorkspaceStatus::Running),
            "stopped" => Ok(WorkspaceStatus::Stopped),
            "failed" => Ok(WorkspaceStatus::Failed),
            "deleted" => Ok(WorkspaceStatus::Deleted),
            other => Err(format!("unknown workspace status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Unknown,
    Connecting,
    Active,
    Busy,
    Error,
    Offline,
    Stopped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Connecting => "connecting",
            NodeStatus::Active => "active",
            NodeStatus::Busy => "busy",
            NodeStatus::Error => "error",
            NodeStatus::Offline => "offline",
            NodeStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(NodeStatus::Unknown),
            "connecting" => Ok(NodeStatus::Connecting),
            "active" => Ok(NodeStatus::Active),
            "busy" => Ok(NodeStatus::Busy),
            "error" => Ok(NodeStatus::Error),
            "offline" => Ok(NodeStatus::Offline),
            "stopped" => Ok(NodeStatus::Stopped),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Session,
    Service,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Create,
    Start,
    Stop,
    Destroy,
    List,
    Exec,
    Status,
    Info,
    Health,
}

/// A command dispatched from the server to a node agent. Immutable once
/// dispatched; results are matched back by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub r#type: CommandType,
    pub action: CommandAction,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    /// Target session (= workspace) id for session/service commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn new(r#type: CommandType, action: CommandAction, timeout_secs: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            r#type,
            action,
            params: HashMap::new(),
            session_id: None,
            timeout_secs,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Failed,
    Running,
}

/// Write-once result for a dispatched command, POSTed back by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Id of the originating command.
    pub command_id: String,
    pub node_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn success(command_id: &str, node_id: &str, output: impl Into<String>) -> Self {
        Self {
            command_id: command_id.to_string(),
            node_id: node_id.to_string(),
            status: CommandStatus::Success,
            output: output.into(),
            error: None,
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(command_id: &str, node_id: &str, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.to_string(),
            node_id: node_id.to_string(),
            status: CommandStatus::Failed,
            output: String::new(),
            error: Some(error.into()),
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Payload carried in a successful `session.create` result's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub ssh_port: u16,
    pub services: HashMap<String, u16>,
}

// ── Node registration & heartbeat ────────────────────────────────────────────

/// Agent self-description POSTed at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Provider names this node can run (e.g. `docker`, `lxc`, `vm`).
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// OS / arch / CPU count / runtime versions.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub version: String,
    /// Session ids found labelled with [`SESSION_LABEL`] at agent startup,
    /// so the server can re-associate workspaces after a restart.
    #[serde(default)]
    pub recovered_sessions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub last_seen: DateTime<Utc>,
    pub status: NodeStatus,
    /// Sessions currently present on the node and their statuses.
    #[serde(default)]
    pub services: HashMap<String, String>,
}

// ── Workspace API shapes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    pub owner: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    /// When present, decides whether a fork is required; the
    /// private-and-not-owner heuristic applies only when absent.
    #[serde(default)]
    pub is_fork: Option<bool>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    pub port: u16,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// `http` or `tcp`.
    pub kind: String,
    pub target: String,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    30
}

fn default_health_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFromRepoRequest {
    pub github_username: String,
    pub workspace_name: String,
    pub repo: RepoSpec,
    pub provider: String,
    pub image: String,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFromRepoResponse {
    pub workspace_id: String,
    pub status: WorkspaceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    pub ssh_port: u16,
    pub services: HashMap<String, u16>,
    pub fork_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSummary {
    pub id: String,
    pub name: String,
    pub status: WorkspaceStatus,
    pub provider: String,
    pub ssh_port: u16,
    pub services: HashMap<String, u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatusResponse {
    pub id: String,
    pub name: String,
    pub status: WorkspaceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    pub ssh_port: u16,
    pub services: HashMap<String, u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ── Error envelope ───────────────────────────────────────────────────────────

/// Machine error codes carried in the `code` field of error responses.
pub mod error_codes {
    pub const AUTH_REQUIRED: &str = "auth_required";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const REPO_NOT_FOUND: &str = "repo_not_found";
    pub const WORKSPACE_EXISTS: &str = "workspace_exists";
    pub const INVALID_PROVIDER: &str = "invalid_provider";
    pub const INSUFFICIENT_RESOURCES: &str = "insufficient_resources";
    pub const PROVIDER_ERROR: &str = "provider_error";
    pub const DATABASE_ERROR: &str = "database_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Error body returned by every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Opaque correlation id attached to every 5xx.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Validate a workspace name: `[a-z0-9-]{1,64}`.
pub fn valid_workspace_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
