mod agent;

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    clap::{Parser, Subcommand},
    tokio::net::TcpListener,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    tether_bridge::BridgeServer,
    tether_channels::{ChannelManager, ChannelRegistry},
    tether_chat::ChatCoordinator,
    tether_gateway::{BridgeBroadcast, Broadcaster, ChatBroadcast, GatewayServer, GatewayState},
    tether_pairing::PairingStore,
    tether_sessions::SessionStore,
};

#[derive(Parser)]
#[command(name = "tether", about = "Tether — local device gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind the gateway to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Gateway port (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Node bridge port (overrides config value).
    #[arg(long, global = true)]
    bridge_port: Option<u16>,
    /// Explicit config file path.
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,
    /// Data directory for the pairing store and transcripts.
    #[arg(long, global = true, env = "TETHER_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway (default when no subcommand is provided).
    Gateway,
    /// Chat transcript management.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Inspect paired and pending nodes.
    Nodes {
        #[command(subcommand)]
        action: NodeAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    List,
    History { key: String },
    Clear { key: String },
}

#[derive(Subcommand)]
enum NodeAction {
    List,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(tether_config::data_dir);

    match cli.command {
        None | Some(Commands::Gateway) => run_gateway(cli, data_dir).await,
        Some(Commands::Sessions { action }) => handle_sessions(data_dir, action).await,
        Some(Commands::Nodes { action }) => handle_nodes(data_dir, action),
    }
}

async fn run_gateway(cli: Cli, data_dir: PathBuf) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "tether starting");

    let config = match &cli.config {
        Some(path) => tether_config::load_config(path)?,
        None => tether_config::discover_and_load(),
    };
    std::fs::create_dir_all(&data_dir)?;

    let bind = cli.bind.unwrap_or_else(|| config.gateway.bind.clone());
    let port = cli.port.unwrap_or(config.gateway.port);
    let bridge_port = cli.bridge_port.unwrap_or(config.bridge.port);

    let broadcaster = Arc::new(Broadcaster::default());
    let store = Arc::new(PairingStore::load(PairingStore::default_path(&data_dir))?);

    let bridge = BridgeServer::new(
        store.clone(),
        Arc::new(BridgeBroadcast {
            broadcaster: broadcaster.clone(),
        }),
    );
    let bridge_handle = bridge.handle();
    let bridge_listener =
        TcpListener::bind((config.bridge.bind.as_str(), bridge_port)).await?;
    info!(addr = %bridge_listener.local_addr()?, "bridge listening");
    tokio::spawn(bridge.run(bridge_listener));

    let channels = Arc::new(ChannelManager::new(
        ChannelRegistry::new(),
        config.channels.clone(),
    ));
    channels.start_all().await;

    let sessions = Arc::new(SessionStore::new(data_dir.join("sessions")));
    let chat = Arc::new(ChatCoordinator::new(
        Arc::new(agent::EchoAgent),
        Arc::new(ChatBroadcast {
            broadcaster: broadcaster.clone(),
        }),
        sessions,
        Duration::from_secs(config.chat.agent_timeout_secs),
    ));

    let state = Arc::new(GatewayState::new(
        config.auth.clone(),
        store,
        bridge_handle,
        channels,
        chat,
        broadcaster,
    ));

    let listener = TcpListener::bind((bind.as_str(), port)).await?;
    GatewayServer::new(state).run(listener).await
}

async fn handle_sessions(data_dir: PathBuf, action: SessionAction) -> anyhow::Result<()> {
    let store = SessionStore::new(data_dir.join("sessions"));
    match action {
        SessionAction::List => {
            let keys = store.list_keys();
            if keys.is_empty() {
                println!("No sessions.");
            }
            for key in keys {
                let count = store.count(&key).await.unwrap_or(0);
                println!("{key}  ({count} messages)");
            }
        },
        SessionAction::History { key } => {
            for message in store.read(&key).await? {
                println!("{message}");
            }
        },
        SessionAction::Clear { key } => {
            store.clear(&key).await?;
            println!("Cleared session '{key}'.");
        },
    }
    Ok(())
}

fn handle_nodes(data_dir: PathBuf, action: NodeAction) -> anyhow::Result<()> {
    let store = PairingStore::load(PairingStore::default_path(&data_dir))?;
    match action {
        NodeAction::List => {
            let pending = store.list_pending();
            if !pending.is_empty() {
                println!("Pending requests:");
                for req in pending {
                    println!("  {}  {} ({})", req.request_id, req.node_id, req.platform);
                }
            }
            let paired = store.list_paired();
            if paired.is_empty() {
                println!("No paired nodes.");
            } else {
                println!("Paired nodes:");
                for node in paired {
                    let name = node.display_name.as_deref().unwrap_or("-");
                    println!("  {}  {name} ({})", node.node_id, node.platform);
                }
            }
        },
    }
    Ok(())
}
