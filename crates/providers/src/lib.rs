//! Isolation backends.
//!
//! A [`Provider`] manages the lifecycle of isolated environments on the
//! local host: Docker containers, LXD system containers, or QEMU virtual
//! machines. All variants are driven through their CLIs; the Docker
//! variant can alternatively funnel every action through a transport to a
//! remote execution host.
//!
//! Every session is labelled with [`dockyard_protocol::SESSION_LABEL`] so
//! that a restarted process can enumerate the sessions it owns via
//! `list()`.

pub mod docker;
pub mod error;
pub mod lxc;
pub mod vm;

use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;

use dockyard_protocol::ServiceSpec;

pub use {
    docker::DockerProvider,
    error::{Error, Result},
    lxc::LxcProvider,
    vm::VmProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Stopped,
    Unknown,
}

/// A provider-layer environment, one-to-one with a workspace while it
/// exists on a host.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Session {
    /// Provider-assigned identifier (container or VM name).
    pub id: String,
    pub provider: String,
    pub status: SessionStatus,
    /// Host port forwarded to the environment's sshd; 0 when none.
    pub ssh_port: u16,
    /// Service name → published host port.
    pub services: HashMap<String, u16>,
    pub labels: HashMap<String, String>,
}

/// Inputs for `create`.
#[derive(Debug, Clone, Default)]
pub struct CreateConfig {
    pub image: String,
    /// Extra environment (the installation token arrives here under
    /// `GITHUB_TOKEN`; values never reach logs).
    pub env: HashMap<String, String>,
    pub services: Vec<ServiceSpec>,
    /// Mount the host docker socket and grant privilege (Docker only).
    pub docker_in_docker: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<String>,
    /// Capture output into the result instead of inheriting.
    pub capture: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Uniform lifecycle contract implemented by every isolation backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backing runtime is usable on this host.
    async fn available(&self) -> bool;

    /// Provision a new environment. The returned session is already
    /// started with its SSH and service ports bound.
    async fn create(
        &self,
        session_id: &str,
        workspace_path: &Path,
        config: &CreateConfig,
    ) -> Result<Session>;

    async fn start(&self, id: &str) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn destroy(&self, id: &str) -> Result<()>;
    async fn exec(&self, id: &str, opts: &ExecOptions) -> Result<ExecOutput>;

    /// Sessions on this host carrying our ownership label.
    async fn list(&self) -> Result<Vec<Session>>;
}

/// The set of providers configured on a host, looked up by name at
/// dispatch time.
#[derive(Default, Clone)]
pub struct ProviderSet {
    providers: HashMap<&'static str, Arc<dyn Provider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.name(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.providers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Probe every provider's runtime; returns name → availability.
    pub async fn availability(&self) -> HashMap<String, bool> {
        let mut map = HashMap::new();
        for (name, provider) in &self.providers {
            map.insert((*name).to_string(), provider.available().await);
        }
        map
    }
}

/// Check whether a CLI binary is on PATH.
pub fn is_cli_available(cli: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(cli).is_file())
}

/// Session name under the runtime for a session id.
pub fn session_name(id: &str) -> String {
    format!("dockyard-{id}")
}

/// Reserve a free host port by briefly binding port 0.
pub(crate) fn alloc_host_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| Error::ResourceExhausted(format!("no free host port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::ResourceExhausted(e.to_string()))?
        .port();
    Ok(port)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_prefixed() {
        assert_eq!(session_name("ab12"), "dockyard-ab12");
    }

    #[test]
    fn alloc_host_port_returns_nonzero() {
        let port = alloc_host_port().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn provider_set_names_sorted() {
        let set = ProviderSet::new();
        assert!(set.names().is_empty());
        assert!(set.get("docker").is_none());
    }
}
