//! Agent lifecycle: registration, heartbeat, and the command worker.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    rand::Rng,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    crate::{executor::Executor, results::ResultSubmitter, server},
    dockyard_common::config::AgentConfig,
    dockyard_protocol::{
        Command, CommandAction, CommandType, HeartbeatRequest, NodeRegistration, NodeStatus,
        SESSION_LABEL,
    },
    dockyard_providers::{Provider as _, ProviderSet},
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Registration backoff bounds.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

pub struct NodeAgent {
    node_id: String,
    node_name: String,
    config: AgentConfig,
    providers: ProviderSet,
    executor: Arc<Executor>,
    submitter: Arc<ResultSubmitter>,
    client: reqwest::Client,
    /// Sessions currently provisioning; heartbeat reports `busy` while > 0.
    provisioning: Arc<AtomicUsize>,
}

/// Handles for a running agent; cancel to shut down.
pub struct AgentHandle {
    pub shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl AgentHandle {
    /// Cancel every loop and wait for them to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl NodeAgent {
    pub fn new(config: AgentConfig, providers: ProviderSet, workspace_root: PathBuf) -> Self {
        let node_name = config.node_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]))
        });
        let node_id = node_name.clone();
        let submitter = Arc::new(ResultSubmitter::new(
            reqwest::Client::new(),
            config.server_url.clone(),
            config.result_buffer,
        ));
        let executor = Arc::new(Executor::new(
            node_id.clone(),
            providers.clone(),
            workspace_root,
        ));
        Self {
            node_id,
            node_name,
            config,
            providers,
            executor,
            submitter,
            client: reqwest::Client::new(),
            provisioning: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Start every loop: the command listener, the queue worker, the
    /// registration retry, and the heartbeat. Returns once the listener is
    /// bound.
    pub async fn start(self: Arc<Self>, bind: &str, port: u16) -> crate::Result<AgentHandle> {
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Command>(self.config.queue_capacity);

        let mut tasks = Vec::new();

        // Command listener.
        let listener = tokio::net::TcpListener::bind((bind, port)).await?;
        let local_port = listener.local_addr()?.port();
        let router = server::build_router(
            tx.clone(),
            Arc::clone(&self.executor),
            self.node_id.clone(),
            self.providers.clone(),
        );
        let server_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "agent listener exited");
            }
        }));
        info!(node = %self.node_id, port = local_port, "agent listening for commands");

        // Queue worker.
        tasks.push(tokio::spawn(
            Arc::clone(&self).worker_loop(rx, shutdown.clone()),
        ));

        // Registration with backoff, then heartbeat.
        tasks.push(tokio::spawn(Arc::clone(&self).registration_loop(
            local_port,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(
            Arc::clone(&self).heartbeat_loop(shutdown.clone()),
        ));

        Ok(AgentHandle { shutdown, tasks })
    }

    /// Single worker draining the bounded queue in order.
    async fn worker_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
    ) {
        loop {
            let cmd = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let is_provisioning =
                cmd.r#type == CommandType::Session && cmd.action == CommandAction::Create;
            if is_provisioning {
                self.provisioning.fetch_add(1, Ordering::SeqCst);
            }
            let result = self.executor.execute(&cmd).await;
            if is_provisioning {
                self.provisioning.fetch_sub(1, Ordering::SeqCst);
            }
            self.submitter.submit(result).await;
        }
        debug!(node = %self.node_id, "command worker stopped");
    }

    /// Register with the server; in offline mode keep operating and retry
    /// with exponential backoff until registration lands.
    async fn registration_loop(self: Arc<Self>, port: u16, shutdown: CancellationToken) {
        let mut backoff = BACKOFF_START;
        loop {
            match self.register(port).await {
                Ok(()) => {
                    info!(node = %self.node_id, "registered with coordination server");
                    break;
                },
                Err(e) => {
                    warn!(node = %self.node_id, error = %e, backoff_secs = backoff.as_secs(),
                          "registration failed, retrying");
                },
            }
            let jitter = Duration::from_millis(rand::rng().random_range(0..250));
            tokio::select! {
                _ = tokio::time::sleep(backoff + jitter) => {},
                _ = shutdown.cancelled() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn register(&self, port: u16) -> crate::Result<()> {
        let mut capabilities = Vec::new();
        for name in self.providers.names() {
            if let Some(provider) = self.providers.get(name)
                && provider.available().await
            {
                capabilities.push(name.to_string());
            }
        }

        let registration = NodeRegistration {
            id: self.node_id.clone(),
            name: self.node_name.clone(),
            host: self
                .config
                .advertise_addr
                .clone()
                .unwrap_or_else(|| "127.0.0.1".into()),
            port,
            capabilities,
            labels: HashMap::new(),
            metadata: HashMap::from([
                ("os".to_string(), std::env::consts::OS.to_string()),
                ("arch".to_string(), std::env::consts::ARCH.to_string()),
                (
                    "cpus".to_string(),
                    std::thread::available_parallelism()
                        .map(usize::from)
                        .unwrap_or(1)
                        .to_string(),
                ),
            ]),
            version: VERSION.to_string(),
            recovered_sessions: self.recover_sessions().await,
        };

        let url = format!("{}/api/v1/nodes", self.config.server_url);
        let resp = self
            .client
            .post(&url)
            .json(&registration)
            .send()
            .await
            .map_err(|e| crate::Error::ServerUnreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(crate::Error::ServerUnreachable(format!(
                "registration returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Enumerate provider sessions carrying our ownership label so the
    /// server can re-associate workspaces after restarts.
    async fn recover_sessions(&self) -> Vec<String> {
        let mut recovered = Vec::new();
        for name in self.providers.names() {
            let Some(provider) = self.providers.get(name) else {
                continue;
            };
            match provider.list().await {
                Ok(sessions) => {
                    for session in sessions {
                        if let Some(id) = session.labels.get(SESSION_LABEL) {
                            recovered.push(id.clone());
                        }
                    }
                },
                Err(e) => debug!(provider = name, error = %e, "session recovery listing failed"),
            }
        }
        recovered.sort();
        recovered.dedup();
        recovered
    }

    async fn heartbeat_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {},
                _ = shutdown.cancelled() => break,
            }
            if let Err(e) = self.heartbeat().await {
                warn!(node = %self.node_id, error = %e, "heartbeat failed");
            }
        }
        // Best-effort deregistration on the way out.
        let url = format!("{}/api/v1/nodes/{}", self.config.server_url, self.node_id);
        if let Err(e) = self.client.delete(&url).send().await {
            debug!(error = %e, "deregistration failed");
        }
    }

    async fn heartbeat(&self) -> crate::Result<()> {
        let status = if self.provisioning.load(Ordering::SeqCst) > 0 {
            NodeStatus::Busy
        } else {
            NodeStatus::Active
        };

        let mut services = HashMap::new();
        for name in self.providers.names() {
            if let Some(provider) = self.providers.get(name)
                && let Ok(sessions) = provider.list().await
            {
                for session in sessions {
                    if let Some(id) = session.labels.get(SESSION_LABEL) {
                        services.insert(id.clone(), format!("{:?}", session.status).to_lowercase());
                    }
                }
            }
        }

        let body = HeartbeatRequest {
            last_seen: chrono::Utc::now(),
            status,
            services,
        };
        let url = format!(
            "{}/api/v1/nodes/{}/heartbeat",
            self.config.server_url, self.node_id
        );
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| crate::Error::ServerUnreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(crate::Error::ServerUnreachable(format!(
                "heartbeat returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
