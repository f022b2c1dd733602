//! Configuration schema and loading.
//!
//! Config is read once at startup from `dockyard.toml` (project-local, then
//! `~/.config/dockyard/`), with `${ENV_VAR}` placeholders substituted before
//! parsing and a handful of well-known environment variables applied on top.
//! After load the config is immutable; subsystems receive it by value or
//! behind `Arc`, never through globals.

use std::path::{Path, PathBuf};

use {
    secrecy::Secret,
    serde::Deserialize,
    tracing::{debug, warn},
};

const CONFIG_FILENAME: &str = "dockyard.toml";

/// Default upstream server URL for agents.
pub const DEFAULT_COORDINATION_URL: &str = "http://localhost:3001";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DockyardConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub workspaces: WorkspacesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable hostname handed to clients as the SSH host.
    #[serde(default)]
    pub public_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            public_host: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    3001
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    /// SQLite database path. Unset means the in-memory registry.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Where the transport manager persists its named configurations.
    #[serde(default)]
    pub transports_path: Option<PathBuf>,
}

/// GitHub App credentials. All fields come from the environment in typical
/// deployments; the config file form exists for development setups.
#[derive(Clone, Deserialize, Default)]
pub struct GithubConfig {
    #[serde(default)]
    pub app_id: Option<u64>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<Secret<String>>,
    /// Base64-encoded PEM RSA private key (PKCS#1 or PKCS#8).
    #[serde(default)]
    pub private_key: Option<Secret<String>>,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

impl std::fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubConfig")
            .field("app_id", &self.app_id)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("redirect_url", &self.redirect_url)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Upstream coordination server.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Stable node identifier; defaults to the hostname when unset.
    #[serde(default)]
    pub node_name: Option<String>,
    /// Address the agent is reachable on, advertised at registration.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Port the agent's command listener binds (0 = ephemeral).
    #[serde(default = "default_agent_port")]
    pub listen_port: u16,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Consecutive missed heartbeats before the server marks a node offline.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Cap on results buffered while the server is unreachable.
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            node_name: None,
            advertise_addr: None,
            listen_port: default_agent_port(),
            heartbeat_secs: default_heartbeat_secs(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            queue_capacity: default_queue_capacity(),
            result_buffer: default_result_buffer(),
        }
    }
}

fn default_server_url() -> String {
    DEFAULT_COORDINATION_URL.into()
}

fn default_agent_port() -> u16 {
    3002
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

fn default_queue_capacity() -> usize {
    64
}

fn default_result_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub lxc: LxcConfig,
    #[serde(default)]
    pub vm: VmConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Mount the host docker socket into created containers.
    #[serde(default)]
    pub docker_in_docker: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            docker_in_docker: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LxcConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory holding per-session disk images.
    #[serde(default = "default_vm_base_dir")]
    pub base_dir: PathBuf,
    /// Base image cloned for each new session.
    #[serde(default)]
    pub base_image: Option<PathBuf>,
    #[serde(default = "default_vm_cpus")]
    pub cpus: u32,
    #[serde(default = "default_vm_memory_mb")]
    pub memory_mb: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_dir: default_vm_base_dir(),
            base_image: None,
            cpus: default_vm_cpus(),
            memory_mb: default_vm_memory_mb(),
        }
    }
}

fn default_vm_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/dockyard/images")
}

fn default_vm_cpus() -> u32 {
    2
}

fn default_vm_memory_mb() -> u32 {
    2048
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspacesConfig {
    /// Per-workspace directories are created under this root on each node.
    #[serde(default = "default_workspace_root")]
    pub root_dir: PathBuf,
}

impl Default for WorkspacesConfig {
    fn default() -> Self {
        Self {
            root_dir: default_workspace_root(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/var/lib/dockyard/workspaces")
}

fn default_true() -> bool {
    true
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// Load config from the given path.
pub fn load_config(path: &Path) -> crate::Result<DockyardConfig> {
    let raw = std::fs::read_to_string(path)?;
    let raw = expand_env_placeholders(&raw);
    let mut cfg: DockyardConfig = toml::from_str(&raw)
        .map_err(|e| crate::Error::message(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load `dockyard.toml` from the working directory, then the user config
/// dir. A candidate that exists but fails to parse is skipped with a
/// warning rather than aborting startup; with no usable file the defaults
/// (plus environment overrides) apply.
pub fn discover_and_load() -> DockyardConfig {
    for candidate in config_search_paths() {
        if !candidate.is_file() {
            continue;
        }
        match load_config(&candidate) {
            Ok(cfg) => {
                debug!(path = %candidate.display(), "loaded config");
                return cfg;
            },
            Err(e) => {
                warn!(path = %candidate.display(), error = %e, "skipping unreadable config");
            },
        }
    }
    debug!("no config file found, using defaults");
    let mut cfg = DockyardConfig::default();
    apply_env_overrides(&mut cfg);
    cfg
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(CONFIG_FILENAME)];
    if let Some(dirs) = directories::ProjectDirs::from("", "", "dockyard") {
        candidates.push(dirs.config_dir().join(CONFIG_FILENAME));
    }
    candidates
}

/// Apply the well-known environment variables on top of the parsed config.
fn apply_env_overrides(cfg: &mut DockyardConfig) {
    if let Ok(v) = std::env::var("GITHUB_APP_ID")
        && let Ok(id) = v.parse()
    {
        cfg.github.app_id = Some(id);
    }
    if let Ok(v) = std::env::var("GITHUB_APP_CLIENT_ID") {
        cfg.github.client_id = Some(v);
    }
    if let Ok(v) = std::env::var("GITHUB_APP_CLIENT_SECRET") {
        cfg.github.client_secret = Some(Secret::new(v));
    }
    if let Ok(v) = std::env::var("GITHUB_APP_PRIVATE_KEY") {
        cfg.github.private_key = Some(Secret::new(v));
    }
    if let Ok(v) = std::env::var("GITHUB_APP_REDIRECT_URL") {
        cfg.github.redirect_url = Some(v);
    }
    if let Ok(v) = std::env::var("DB_PATH") {
        cfg.storage.db_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("COORDINATION_URL") {
        cfg.agent.server_url = v;
    }
}

/// Expand `${ENV_VAR}` placeholders in the raw config text.
///
/// Placeholders that do not resolve stay untouched, so secrets can be
/// templated without failing hard on machines that lack them.
pub fn expand_env_placeholders(raw: &str) -> String {
    expand_with(raw, |name| std::env::var(name).ok())
}

fn expand_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 2..];
        let Some(close) = tail.find('}') else {
            // Unterminated placeholder; keep the remainder verbatim.
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &tail[..close];
        match (!name.is_empty()).then(|| lookup(name)).flatten() {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str(&rest[open..open + 2 + close + 1]);
            },
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    out
}
