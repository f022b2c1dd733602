//! Provider-agnostic remote execution.
//!
//! The server drives remote execution hosts through the [`Transport`]
//! trait: a secure-shell variant for hosts reachable over SSH and an HTTP
//! variant for hosts running an agent endpoint. Connections are pooled per
//! target ([`pool`]) and named configurations are managed and persisted by
//! the [`manager`].

pub mod error;
pub mod http;
pub mod manager;
pub mod pool;
pub mod ssh;

use {async_trait::async_trait, tokio::io::AsyncWrite};

use dockyard_protocol::{Command, CommandAction, CommandResult, CommandType};

pub use {
    error::{Error, Result},
    http::{HttpAuth, HttpTransport},
    manager::{TransportConfig, TransportManager},
    pool::{Pool, PoolConfig, PoolMetricsSnapshot},
    ssh::{SshAuth, SshTransport},
};

// Parameter keys for exec-shaped commands carried over a transport.
pub const PARAM_PROGRAM: &str = "program";
pub const PARAM_ARGS: &str = "args";
pub const PARAM_ENV: &str = "env";
pub const PARAM_CWD: &str = "cwd";

/// Build a `system.exec` command for a remote argv.
pub fn exec_command(
    program: &str,
    args: &[&str],
    env: &[(&str, &str)],
    cwd: Option<&str>,
    timeout_secs: u64,
) -> Command {
    let mut cmd = Command::new(CommandType::System, CommandAction::Exec, timeout_secs)
        .with_param(PARAM_PROGRAM, serde_json::json!(program))
        .with_param(PARAM_ARGS, serde_json::json!(args));
    if !env.is_empty() {
        let map: std::collections::HashMap<&str, &str> = env.iter().copied().collect();
        cmd = cmd.with_param(PARAM_ENV, serde_json::json!(map));
    }
    if let Some(dir) = cwd {
        cmd = cmd.with_param(PARAM_CWD, serde_json::json!(dir));
    }
    cmd
}

/// Bidirectional command/result channel to one remote endpoint.
///
/// `execute` captures output into the returned [`CommandResult`];
/// `stream` copies output into caller-provided writers as it arrives and
/// resolves to the remote exit code.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    /// Cheap liveness check used by the pool's keepalive loop.
    async fn probe(&self) -> Result<()>;

    async fn execute(&self, command: &Command) -> Result<CommandResult>;

    async fn stream(
        &self,
        command: &Command,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i32>;
}
