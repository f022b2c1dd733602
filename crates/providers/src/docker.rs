//! Docker provider.
//!
//! Drives the `docker` CLI on the local host, or — when constructed with a
//! remote transport — funnels every invocation through that transport so
//! the same provider can manage a docker daemon on another machine.

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use {async_trait::async_trait, tracing::{debug, info}};

use {
    crate::{
        CreateConfig, Error, ExecOptions, ExecOutput, Provider, Result, Session, SessionStatus,
        alloc_host_port,
        error::classify_runtime_stderr,
        is_cli_available, session_name,
    },
    dockyard_protocol::{SESSION_LABEL, service_url_env},
    dockyard_transport::Transport,
};

/// Where the workspace directory is bind-mounted inside every container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

const SHORT_TIMEOUT_SECS: u64 = 30;
const CREATE_TIMEOUT_SECS: u64 = 120;
const PULL_TIMEOUT_SECS: u64 = 300;

struct CliOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

pub struct DockerProvider {
    remote: Option<Arc<dyn Transport>>,
    /// Host-level default; a per-create request can also ask for it.
    docker_in_docker: bool,
}

impl DockerProvider {
    pub fn new() -> Self {
        Self {
            remote: None,
            docker_in_docker: false,
        }
    }

    /// All actions go through `transport` instead of the local CLI.
    pub fn remote(transport: Arc<dyn Transport>) -> Self {
        Self {
            remote: Some(transport),
            docker_in_docker: false,
        }
    }

    /// Mount the host docker socket into every created container.
    #[must_use]
    pub fn with_docker_in_docker(mut self, enabled: bool) -> Self {
        self.docker_in_docker = enabled;
        self
    }

    async fn run(&self, args: &[&str], timeout_secs: u64) -> Result<CliOutput> {
        match &self.remote {
            None => {
                let output = tokio::time::timeout(
                    Duration::from_secs(timeout_secs),
                    tokio::process::Command::new("docker").args(args).output(),
                )
                .await
                .map_err(|_| Error::TransientRuntime("docker invocation timed out".into()))??;
                Ok(CliOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    success: output.status.success(),
                })
            },
            Some(transport) => {
                let cmd = dockyard_transport::exec_command("docker", args, &[], None, timeout_secs);
                let result = transport.execute(&cmd).await?;
                let success =
                    result.status == dockyard_protocol::CommandStatus::Success;
                Ok(CliOutput {
                    stdout: result.output,
                    stderr: result.error.unwrap_or_default(),
                    success,
                })
            },
        }
    }

    async fn run_ok(&self, args: &[&str], timeout_secs: u64) -> Result<String> {
        let out = self.run(args, timeout_secs).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(classify_runtime_stderr(&out.stderr))
        }
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.run(&["image", "inspect", image], SHORT_TIMEOUT_SECS)
            .await
            .map(|o| o.success)
            .unwrap_or(false)
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await {
            return Ok(());
        }
        info!(image, "pulling image");
        self.run_ok(&["pull", image], PULL_TIMEOUT_SECS)
            .await
            .map_err(|e| match e {
                Error::FatalRuntime(msg) => Error::ImageUnavailable(msg),
                other => other,
            })?;
        Ok(())
    }

    async fn published_port(&self, name: &str, container_port: u16) -> Result<u16> {
        let out = self
            .run_ok(
                &["port", name, &format!("{container_port}/tcp")],
                SHORT_TIMEOUT_SECS,
            )
            .await?;
        parse_published_port(&out)
            .ok_or_else(|| Error::FatalRuntime(format!("unparseable docker port output: {out}")))
    }
}

impl Default for DockerProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the full `docker run` argv for a session.
fn run_args(
    name: &str,
    session_id: &str,
    workspace_path: &Path,
    config: &CreateConfig,
    ssh_port: u16,
    service_ports: &HashMap<String, u16>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        name.into(),
        "--label".into(),
        format!("{SESSION_LABEL}={session_id}"),
        "-v".into(),
        format!("{}:{WORKSPACE_MOUNT}", workspace_path.display()),
        "-w".into(),
        WORKSPACE_MOUNT.into(),
        "-p".into(),
        format!("127.0.0.1:{ssh_port}:22"),
    ];

    for service in &config.services {
        if let Some(host_port) = service_ports.get(&service.name) {
            args.push("-p".into());
            args.push(format!("127.0.0.1:{host_port}:{}", service.port));
            args.push("-e".into());
            args.push(format!(
                "{}=http://localhost:{host_port}",
                service_url_env(&service.name)
            ));
        }
    }

    for (key, value) in &config.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    if config.docker_in_docker {
        args.push("-v".into());
        args.push("/var/run/docker.sock:/var/run/docker.sock".into());
        args.push("--privileged".into());
    }

    args.push(config.image.clone());
    args
}

fn parse_published_port(output: &str) -> Option<u16> {
    // `docker port` prints lines like `127.0.0.1:32801`.
    output
        .lines()
        .next()?
        .trim()
        .rsplit(':')
        .next()?
        .parse()
        .ok()
}

fn parse_ps_status(status: &str) -> SessionStatus {
    if status.starts_with("Up") {
        SessionStatus::Running
    } else if status.starts_with("Exited") {
        SessionStatus::Stopped
    } else if status.starts_with("Created") {
        SessionStatus::Created
    } else {
        SessionStatus::Unknown
    }
}

/// Extract our session id from a docker `{{.Labels}}` column
/// (`k1=v1,k2=v2`).
fn session_id_from_labels(labels: &str) -> Option<String> {
    labels.split(',').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == SESSION_LABEL).then(|| value.to_string())
    })
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn available(&self) -> bool {
        if self.remote.is_none() && !is_cli_available("docker") {
            return false;
        }
        self.run(&["version", "--format", "{{.Server.Version}}"], SHORT_TIMEOUT_SECS)
            .await
            .map(|o| o.success)
            .unwrap_or(false)
    }

    async fn create(
        &self,
        session_id: &str,
        workspace_path: &Path,
        config: &CreateConfig,
    ) -> Result<Session> {
        self.ensure_image(&config.image).await?;

        let name = session_name(session_id);
        let ssh_port = alloc_host_port()?;
        let mut service_ports = HashMap::new();
        for service in &config.services {
            service_ports.insert(service.name.clone(), alloc_host_port()?);
        }

        let mut config = config.clone();
        config.docker_in_docker |= self.docker_in_docker;
        let args = run_args(
            &name,
            session_id,
            workspace_path,
            &config,
            ssh_port,
            &service_ports,
        );
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_ok(&arg_refs, CREATE_TIMEOUT_SECS).await?;
        debug!(session = session_id, container = %name, ssh_port, "container started");

        Ok(Session {
            id: name,
            provider: "docker".into(),
            status: SessionStatus::Running,
            ssh_port,
            services: service_ports,
            labels: HashMap::from([(SESSION_LABEL.to_string(), session_id.to_string())]),
        })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run_ok(&["start", id], SHORT_TIMEOUT_SECS).await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.run_ok(&["stop", "-t", "10", id], SHORT_TIMEOUT_SECS)
            .await?;
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        match self.run_ok(&["rm", "-f", id], SHORT_TIMEOUT_SECS).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exec(&self, id: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let mut args: Vec<String> = vec!["exec".into()];
        if let Some(dir) = &opts.workdir {
            args.push("-w".into());
            args.push(dir.clone());
        }
        for (key, value) in &opts.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(id.into());
        args.extend(opts.command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(&arg_refs, SHORT_TIMEOUT_SECS).await?;
        Ok(ExecOutput {
            exit_code: if out.success { 0 } else { 1 },
            stdout: if opts.capture { out.stdout } else { String::new() },
            stderr: if opts.capture { out.stderr } else { String::new() },
        })
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let out = self
            .run_ok(
                &[
                    "ps",
                    "-a",
                    "--filter",
                    &format!("label={SESSION_LABEL}"),
                    "--format",
                    "{{.Names}}\t{{.Status}}\t{{.Labels}}",
                ],
                SHORT_TIMEOUT_SECS,
            )
            .await?;

        let mut sessions = Vec::new();
        for line in out.lines() {
            let parts: Vec<&str> = line.splitn(3, '\t').collect();
            if parts.len() != 3 {
                continue;
            }
            let Some(session_id) = session_id_from_labels(parts[2]) else {
                continue;
            };
            let status = parse_ps_status(parts[1]);
            let ssh_port = if status == SessionStatus::Running {
                self.published_port(parts[0], 22).await.unwrap_or(0)
            } else {
                0
            };
            sessions.push(Session {
                id: parts[0].to_string(),
                provider: "docker".into(),
                status,
                ssh_port,
                services: HashMap::new(),
                labels: HashMap::from([(SESSION_LABEL.to_string(), session_id)]),
            });
        }
        Ok(sessions)
    }
}
