//! Linux system-container provider, driven through the LXD CLI.
//!
//! Identity is the container name. There is no image pulling: the base
//! image reference is handed to `lxc init` and resolution is the runtime's
//! concern. The ownership label lives in LXD's `user.*` config namespace;
//! SSH and service ports are exposed with proxy devices.

use std::{collections::HashMap, path::Path, time::Duration};

use {async_trait::async_trait, tracing::debug};

use {
    crate::{
        CreateConfig, Error, ExecOptions, ExecOutput, Provider, Result, Session, SessionStatus,
        alloc_host_port,
        error::classify_runtime_stderr,
        is_cli_available, session_name,
    },
    dockyard_protocol::{SESSION_LABEL, service_url_env},
};

const SHORT_TIMEOUT_SECS: u64 = 30;
const CREATE_TIMEOUT_SECS: u64 = 120;

/// LXD config key carrying the session id.
fn label_key() -> String {
    format!("user.{SESSION_LABEL}")
}

pub struct LxcProvider;

impl LxcProvider {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str], timeout_secs: u64) -> Result<String> {
        let output = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tokio::process::Command::new("lxc").args(args).output(),
        )
        .await
        .map_err(|_| Error::TransientRuntime("lxc invocation timed out".into()))??;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_runtime_stderr(&String::from_utf8_lossy(
                &output.stderr,
            )))
        }
    }
}

impl Default for LxcProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for LxcProvider {
    fn name(&self) -> &'static str {
        "lxc"
    }

    async fn available(&self) -> bool {
        is_cli_available("lxc")
            && self
                .run(&["query", "/1.0"], SHORT_TIMEOUT_SECS)
                .await
                .is_ok()
    }

    async fn create(
        &self,
        session_id: &str,
        workspace_path: &Path,
        config: &CreateConfig,
    ) -> Result<Session> {
        let name = session_name(session_id);
        self.run(&["init", &config.image, &name], CREATE_TIMEOUT_SECS)
            .await?;
        self.run(
            &[
                "config",
                "set",
                &name,
                &format!("{}={session_id}", label_key()),
            ],
            SHORT_TIMEOUT_SECS,
        )
        .await?;

        let workspace = workspace_path.display().to_string();
        self.run(
            &[
                "config",
                "device",
                "add",
                &name,
                "workspace",
                "disk",
                &format!("source={workspace}"),
                "path=/workspace",
            ],
            SHORT_TIMEOUT_SECS,
        )
        .await?;

        let ssh_port = alloc_host_port()?;
        self.run(
            &[
                "config",
                "device",
                "add",
                &name,
                "ssh",
                "proxy",
                &format!("listen=tcp:127.0.0.1:{ssh_port}"),
                "connect=tcp:127.0.0.1:22",
            ],
            SHORT_TIMEOUT_SECS,
        )
        .await?;

        let mut service_ports = HashMap::new();
        for service in &config.services {
            let host_port = alloc_host_port()?;
            self.run(
                &[
                    "config",
                    "device",
                    "add",
                    &name,
                    &service.name,
                    "proxy",
                    &format!("listen=tcp:127.0.0.1:{host_port}"),
                    &format!("connect=tcp:127.0.0.1:{}", service.port),
                ],
                SHORT_TIMEOUT_SECS,
            )
            .await?;
            self.run(
                &[
                    "config",
                    "set",
                    &name,
                    &format!(
                        "environment.{}=http://localhost:{host_port}",
                        service_url_env(&service.name)
                    ),
                ],
                SHORT_TIMEOUT_SECS,
            )
            .await?;
            service_ports.insert(service.name.clone(), host_port);
        }

        for (key, value) in &config.env {
            self.run(
                &["config", "set", &name, &format!("environment.{key}={value}")],
                SHORT_TIMEOUT_SECS,
            )
            .await?;
        }

        self.run(&["start", &name], CREATE_TIMEOUT_SECS).await?;
        debug!(session = session_id, container = %name, ssh_port, "lxc container started");

        Ok(Session {
            id: name,
            provider: "lxc".into(),
            status: SessionStatus::Running,
            ssh_port,
            services: service_ports,
            labels: HashMap::from([(SESSION_LABEL.to_string(), session_id.to_string())]),
        })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&["start", id], CREATE_TIMEOUT_SECS).await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.run(&["stop", id, "--timeout", "10"], SHORT_TIMEOUT_SECS)
            .await?;
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        match self.run(&["delete", id, "--force"], SHORT_TIMEOUT_SECS).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exec(&self, id: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let mut args: Vec<String> = vec!["exec".into(), id.into()];
        if let Some(dir) = &opts.workdir {
            args.push("--cwd".into());
            args.push(dir.clone());
        }
        for (key, value) in &opts.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        args.push("--".into());
        args.extend(opts.command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.run(&arg_refs, SHORT_TIMEOUT_SECS).await {
            Ok(stdout) => Ok(ExecOutput {
                exit_code: 0,
                stdout: if opts.capture { stdout } else { String::new() },
                stderr: String::new(),
            }),
            Err(Error::FatalRuntime(stderr)) => Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: if opts.capture { stderr } else { String::new() },
            }),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let out = self
            .run(&["list", "--format", "json"], SHORT_TIMEOUT_SECS)
            .await?;
        let instances: serde_json::Value = serde_json::from_str(&out)
            .map_err(|e| Error::FatalRuntime(format!("unparseable lxc list output: {e}")))?;

        let mut sessions = Vec::new();
        let Some(instances) = instances.as_array() else {
            return Ok(sessions);
        };
        for instance in instances {
            let Some(session_id) = instance
                .pointer(&format!("/config/{}", label_key().replace('/', "~1")))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            let name = instance
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let status = match instance.get("status").and_then(|v| v.as_str()) {
                Some("Running") => SessionStatus::Running,
                Some("Stopped") => SessionStatus::Stopped,
                _ => SessionStatus::Unknown,
            };
            let ssh_port = instance
                .pointer("/devices/ssh/listen")
                .and_then(|v| v.as_str())
                .and_then(parse_proxy_port)
                .unwrap_or(0);
            sessions.push(Session {
                id: name,
                provider: "lxc".into(),
                status,
                ssh_port,
                services: HashMap::new(),
                labels: HashMap::from([(SESSION_LABEL.to_string(), session_id.to_string())]),
            });
        }
        Ok(sessions)
    }
}

/// Parse the port out of a proxy device listen spec
/// (`tcp:127.0.0.1:32801`).
fn parse_proxy_port(listen: &str) -> Option<u16> {
    listen.rsplit(':').next()?.parse().ok()
}
