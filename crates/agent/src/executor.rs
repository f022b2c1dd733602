//! Command executors, dispatched by command type.
//!
//! Every executor turns a [`Command`] into a write-once [`CommandResult`];
//! errors never escape as panics or protocol failures, they become failed
//! results so the server can reconcile by command id.

use std::{collections::HashMap, path::PathBuf, time::Instant};

use tracing::{info, warn};

use {
    dockyard_protocol::{
        Command, CommandAction, CommandResult, CommandType, ServiceSpec, SessionCreated, params,
    },
    dockyard_providers::{CreateConfig, ExecOptions, Provider, ProviderSet, session_name},
};

pub struct Executor {
    node_id: String,
    providers: ProviderSet,
    /// Per-workspace directories are created under this root.
    workspace_root: PathBuf,
}

impl Executor {
    pub fn new(node_id: impl Into<String>, providers: ProviderSet, workspace_root: PathBuf) -> Self {
        Self {
            node_id: node_id.into(),
            providers,
            workspace_root,
        }
    }

    pub async fn execute(&self, cmd: &Command) -> CommandResult {
        let started = Instant::now();
        let result = match cmd.r#type {
            CommandType::Session => self.execute_session(cmd).await,
            CommandType::Service => self.execute_service(cmd).await,
            CommandType::System => self.execute_system(cmd).await,
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(output) => {
                CommandResult::success(&cmd.id, &self.node_id, output).with_duration(duration_ms)
            },
            Err(message) => {
                warn!(command = %cmd.id, error = %message, "command failed");
                CommandResult::failed(&cmd.id, &self.node_id, message).with_duration(duration_ms)
            },
        }
    }

    fn provider(&self, cmd: &Command) -> Result<std::sync::Arc<dyn Provider>, String> {
        let name = cmd
            .param_str(params::PROVIDER)
            .ok_or_else(|| "command missing 'provider' param".to_string())?;
        self.providers
            .get(name)
            .ok_or_else(|| format!("provider not available on this node: {name}"))
    }

    fn session_id(cmd: &Command) -> Result<&str, String> {
        cmd.session_id
            .as_deref()
            .ok_or_else(|| "command missing session id".to_string())
    }

    async fn execute_session(&self, cmd: &Command) -> Result<String, String> {
        let provider = self.provider(cmd)?;
        let session_id = Self::session_id(cmd)?;
        let name = session_name(session_id);

        match cmd.action {
            CommandAction::Create => {
                let image = cmd
                    .param_str(params::IMAGE)
                    .ok_or_else(|| "command missing 'image' param".to_string())?;
                let env: HashMap<String, String> = cmd
                    .params
                    .get(params::ENV)
                    .map(|v| serde_json::from_value(v.clone()))
                    .transpose()
                    .map_err(|e| format!("bad 'env' param: {e}"))?
                    .unwrap_or_default();
                let services: Vec<ServiceSpec> = cmd
                    .params
                    .get(params::SERVICES)
                    .map(|v| serde_json::from_value(v.clone()))
                    .transpose()
                    .map_err(|e| format!("bad 'services' param: {e}"))?
                    .unwrap_or_default();
                let workspace_path = cmd
                    .param_str(params::WORKSPACE_PATH)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.workspace_root.join(session_id));
                std::fs::create_dir_all(&workspace_path)
                    .map_err(|e| format!("cannot create workspace dir: {e}"))?;

                let config = CreateConfig {
                    image: image.to_string(),
                    env,
                    services,
                    docker_in_docker: false,
                };
                let session = provider
                    .create(session_id, &workspace_path, &config)
                    .await
                    .map_err(|e| e.to_string())?;
                info!(session = session_id, ssh_port = session.ssh_port, "session created");

                let created = SessionCreated {
                    ssh_port: session.ssh_port,
                    services: session.services,
                };
                serde_json::to_string(&created).map_err(|e| e.to_string())
            },
            CommandAction::Start => {
                provider.start(&name).await.map_err(|e| e.to_string())?;
                Ok(String::new())
            },
            CommandAction::Stop => {
                provider.stop(&name).await.map_err(|e| e.to_string())?;
                Ok(String::new())
            },
            CommandAction::Destroy => {
                provider.destroy(&name).await.map_err(|e| e.to_string())?;
                info!(session = session_id, "session destroyed");
                Ok(String::new())
            },
            CommandAction::List => {
                let sessions = provider.list().await.map_err(|e| e.to_string())?;
                serde_json::to_string(&sessions).map_err(|e| e.to_string())
            },
            CommandAction::Exec => {
                let opts = exec_options(cmd)?;
                let output = provider
                    .exec(&name, &opts)
                    .await
                    .map_err(|e| e.to_string())?;
                if output.exit_code == 0 {
                    Ok(output.stdout)
                } else {
                    Err(if output.stderr.is_empty() {
                        format!("exec exited with code {}", output.exit_code)
                    } else {
                        output.stderr
                    })
                }
            },
            CommandAction::Status => {
                let sessions = provider.list().await.map_err(|e| e.to_string())?;
                let session = sessions.into_iter().find(|s| {
                    s.labels.get(dockyard_protocol::SESSION_LABEL).map(String::as_str)
                        == Some(session_id)
                });
                match session {
                    Some(s) => serde_json::to_string(&s).map_err(|e| e.to_string()),
                    None => Err(format!("session not found: {session_id}")),
                }
            },
            other => Err(format!("unsupported session action: {other:?}")),
        }
    }

    /// Service commands run inside an existing session via exec; a health
    /// command with a declared check probes the published port instead.
    async fn execute_service(&self, cmd: &Command) -> Result<String, String> {
        if cmd.action == CommandAction::Health
            && let Some(spec) = cmd.params.get("healthCheck")
        {
            let spec: dockyard_protocol::HealthCheckSpec = serde_json::from_value(spec.clone())
                .map_err(|e| format!("bad 'healthCheck' param: {e}"))?;
            let port = cmd
                .params
                .get("port")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| "health check requires a 'port' param".to_string())?
                as u16;
            return Ok(crate::health::check(&spec, port).await.to_string());
        }

        let provider = self.provider(cmd)?;
        let session_id = Self::session_id(cmd)?;
        let name = session_name(session_id);
        let service = cmd
            .param_str("service")
            .ok_or_else(|| "command missing 'service' param".to_string())?;
        let command = cmd.param_str("command").unwrap_or_default();

        let shell = match cmd.action {
            CommandAction::Start => {
                format!("nohup sh -c '{command}' >/tmp/{service}.log 2>&1 & echo started")
            },
            CommandAction::Stop => format!("pkill -f '{command}' || true"),
            CommandAction::Status | CommandAction::Health => {
                format!("pgrep -f '{command}' >/dev/null && echo running || echo stopped")
            },
            other => return Err(format!("unsupported service action: {other:?}")),
        };

        let opts = ExecOptions {
            command: vec!["sh".into(), "-c".into(), shell],
            env: HashMap::new(),
            workdir: None,
            capture: true,
        };
        let output = provider
            .exec(&name, &opts)
            .await
            .map_err(|e| e.to_string())?;
        Ok(output.stdout.trim().to_string())
    }

    async fn execute_system(&self, cmd: &Command) -> Result<String, String> {
        match cmd.action {
            CommandAction::Info => {
                let info = serde_json::json!({
                    "hostname": hostname::get().ok().and_then(|h| h.into_string().ok()),
                    "os": std::env::consts::OS,
                    "arch": std::env::consts::ARCH,
                    "cpus": std::thread::available_parallelism().map(usize::from).unwrap_or(1),
                    "providers": self.providers.availability().await,
                });
                Ok(info.to_string())
            },
            CommandAction::Health => {
                let health = serde_json::json!({
                    "status": "ok",
                    "providers": self.providers.availability().await,
                });
                Ok(health.to_string())
            },
            CommandAction::Exec => {
                let program = cmd
                    .param_str("program")
                    .ok_or_else(|| "command missing 'program' param".to_string())?;
                let args: Vec<String> = cmd
                    .params
                    .get("args")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default();
                let mut process = tokio::process::Command::new(program);
                process.args(&args);
                if let Some(cwd) = cmd.param_str("cwd") {
                    process.current_dir(cwd);
                }
                if let Some(env) = cmd.params.get("env").and_then(|v| v.as_object()) {
                    for (key, value) in env {
                        if let Some(value) = value.as_str() {
                            process.env(key, value);
                        }
                    }
                }
                let output = tokio::time::timeout(
                    std::time::Duration::from_secs(cmd.timeout_secs),
                    process.output(),
                )
                .await
                .map_err(|_| "exec timed out".to_string())?
                .map_err(|e| e.to_string())?;

                if output.status.success() {
                    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
                } else {
                    Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
                }
            },
            other => Err(format!("unsupported system action: {other:?}")),
        }
    }
}

fn exec_options(cmd: &Command) -> Result<ExecOptions, String> {
    let command: Vec<String> = cmd
        .params
        .get("command")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .ok_or_else(|| "command missing 'command' param".to_string())?;
    let env: HashMap<String, String> = cmd
        .params
        .get("env")
        .map(|v| serde_json::from_value(v.clone()))
        .transpose()
        .map_err(|e| format!("bad 'env' param: {e}"))?
        .unwrap_or_default();
    Ok(ExecOptions {
        command,
        env,
        workdir: cmd.param_str("cwd").map(str::to_owned),
        capture: true,
    })
}
