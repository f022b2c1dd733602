mod client_commands;

use std::sync::Arc;

use {
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    dockyard_common::{DockyardConfig, config},
    dockyard_gateway::GatewayState,
    dockyard_github::{GithubApp, OauthConfig},
    dockyard_providers::{DockerProvider, LxcProvider, ProviderSet, VmProvider},
    dockyard_registry::open_with_fallback,
    dockyard_transport::{PoolConfig, TransportManager},
};

#[derive(Parser)]
#[command(name = "dockyard", about = "dockyard — workspace coordination server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Coordination server URL for client commands and the agent.
    #[arg(long, global = true, env = "COORDINATION_URL")]
    server: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordination server (default when no subcommand given).
    Serve,
    /// Start a node agent on this host.
    Agent,
    /// Workspace queries against a running server.
    Workspaces {
        #[command(subcommand)]
        action: client_commands::WorkspaceAction,
    },
    /// Node queries against a running server.
    Nodes {
        #[command(subcommand)]
        action: client_commands::NodeAction,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,tower_http=warn")));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Build the provider set the config enables.
async fn build_providers(config: &DockyardConfig) -> ProviderSet {
    let mut set = ProviderSet::new();
    if config.providers.docker.enabled {
        set = set.with(Arc::new(
            DockerProvider::new()
                .with_docker_in_docker(config.providers.docker.docker_in_docker),
        ));
    }
    if config.providers.lxc.enabled {
        set = set.with(Arc::new(LxcProvider::new()));
    }
    if config.providers.vm.enabled {
        set = set.with(Arc::new(VmProvider::new(
            config.providers.vm.base_dir.clone(),
            config.providers.vm.base_image.clone(),
            config.providers.vm.cpus,
            config.providers.vm.memory_mb,
        )));
    }
    set
}

fn github_from_config(config: &DockyardConfig) -> (Option<GithubApp>, Option<OauthConfig>) {
    let app = config
        .github
        .app_id
        .zip(config.github.private_key.clone())
        .map(|(app_id, key)| GithubApp::new(app_id, key));
    let oauth = config
        .github
        .client_id
        .clone()
        .zip(config.github.client_secret.clone())
        .map(|(client_id, secret)| {
            let redirect = config
                .github
                .redirect_url
                .clone()
                .unwrap_or_else(|| "http://localhost:3001/auth/github/callback".into());
            OauthConfig::new(client_id, secret, redirect)
        });
    (app, oauth)
}

async fn serve(config: DockyardConfig) -> anyhow::Result<()> {
    let (registry, storage_mode) = open_with_fallback(config.storage.db_path.as_deref()).await;
    let providers = build_providers(&config).await;
    let (github_app, oauth) = github_from_config(&config);

    let transports = match &config.storage.transports_path {
        Some(path) => Arc::new(TransportManager::load(path, PoolConfig::default())?),
        None => Arc::new(TransportManager::new(PoolConfig::default())),
    };

    let state = Arc::new(GatewayState::new(
        config,
        registry,
        storage_mode,
        providers,
        github_app,
        oauth,
        transports,
    ));

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    dockyard_gateway::run(state, shutdown).await?;
    Ok(())
}

async fn run_agent(config: DockyardConfig) -> anyhow::Result<()> {
    let providers = build_providers(&config).await;
    let agent = Arc::new(dockyard_agent::NodeAgent::new(
        config.agent.clone(),
        providers,
        config.workspaces.root_dir.clone(),
    ));
    info!(node = agent.node_id(), "starting node agent");

    let handle = agent.start("0.0.0.0", config.agent.listen_port).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    handle.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let mut config = config::discover_and_load();
    if let Some(bind) = &cli.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(server) = &cli.server {
        config.agent.server_url = server.clone();
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Agent => run_agent(config).await,
        Commands::Workspaces { action } => {
            client_commands::run_workspace_action(&config.agent.server_url, action).await
        },
        Commands::Nodes { action } => {
            client_commands::run_node_action(&config.agent.server_url, action).await
        },
    }
}
