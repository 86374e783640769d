//! meshtun - overlay network tunnel
//!
//! One binary for the three roles: the tunnel client, the relay node and the
//! discovery registry.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meshtun_client::{
    interface::system_provider, ClientConfig, RegistryClient, RegistrySettings, SessionEngine,
    SystemConfigurator,
};
use meshtun_registry::{
    NodeSelector, RegistryConfig, RegistryServer, RegistryState, StaticTokenValidator,
};
use meshtun_server::{RelayServer, ServerConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "meshtun")]
#[command(about = "Join hosts into a virtual network through relay nodes", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a relay node
    Server(ServerArgs),
    /// Connect this host to the overlay network
    Client(ClientArgs),
    /// Run the discovery registry
    Registry(RegistryArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// YAML config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Key clients must present
    #[arg(short, long, env = "MESHTUN_KEY")]
    key: Option<String>,

    /// Overlay gateway address
    #[arg(short, long)]
    gateway: Option<Ipv4Addr>,

    /// Tunnel listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Route manifest file
    #[arg(short, long = "route-file")]
    route_file: Option<PathBuf>,

    /// Nameserver (accepted, not pushed to clients)
    #[arg(short, long)]
    nameserver: Option<String>,

    /// Reverse proxy rule file
    #[arg(short = 'p', long = "reverse-file")]
    reverse_file: Option<PathBuf>,

    /// Switch ethernet frames (TAP)
    #[arg(short, long)]
    tap: bool,

    /// Gateway interface name
    #[arg(long)]
    device: Option<String>,

    /// Run without a local interface at the gateway address
    #[arg(long)]
    no_gateway_device: bool,

    /// Address of the route manifest HTTP endpoint
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Host advertised in the route manifest URL
    #[arg(long)]
    public_host: Option<String>,
}

impl ServerArgs {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(key) = self.key {
            config.key = key;
        }
        if let Some(gateway) = self.gateway {
            config.gateway = gateway;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.route_file.is_some() {
            config.route_file = self.route_file;
        }
        if self.nameserver.is_some() {
            config.nameserver = self.nameserver;
        }
        if self.reverse_file.is_some() {
            config.reverse_file = self.reverse_file;
        }
        if self.http_addr.is_some() {
            config.http_addr = self.http_addr;
        }
        if self.public_host.is_some() {
            config.public_host = self.public_host;
        }
        if self.device.is_some() {
            config.device = self.device;
        }
        config.tap |= self.tap;
        if self.no_gateway_device {
            config.gateway_device = false;
        }

        Ok(config)
    }
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// YAML config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay node address (host:port)
    #[arg(short, long, env = "MESHTUN_SERVER")]
    server: Option<String>,

    /// Key presented to the relay node
    #[arg(short, long, env = "MESHTUN_KEY")]
    key: Option<String>,

    /// Registry base URL used to discover a relay node
    #[arg(long, env = "MESHTUN_REGISTRY")]
    registry: Option<String>,

    /// Registry auth token
    #[arg(long, env = "MESHTUN_REGISTRY_TOKEN")]
    registry_token: Option<String>,

    /// Never fall back to the static server when discovery fails
    #[arg(long)]
    must_discover: bool,

    /// Layer-2 (TAP) interface
    #[arg(short, long)]
    tap: bool,

    /// Interface name
    #[arg(long)]
    device: Option<String>,

    /// Interface index for route commands on Windows
    #[arg(long)]
    interface_index: Option<u32>,
}

impl ClientArgs {
    fn into_config(self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ClientConfig::default(),
        };

        if self.server.is_some() {
            config.server = self.server;
        }
        if let Some(key) = self.key {
            config.key = key;
        }
        if let Some(url) = self.registry {
            let token = config
                .registry
                .take()
                .map(|registry| registry.token)
                .unwrap_or_default();
            config.registry = Some(RegistrySettings {
                url,
                token,
                must: false,
            });
        }
        if let Some(registry) = config.registry.as_mut() {
            if let Some(token) = self.registry_token {
                registry.token = token;
            }
            registry.must |= self.must_discover;
        } else if self.must_discover {
            anyhow::bail!("--must-discover needs a registry");
        }
        if self.device.is_some() {
            config.device = self.device;
        }
        config.tap |= self.tap;

        Ok(config)
    }
}

#[derive(Args, Debug)]
struct RegistryArgs {
    /// YAML config file with tokens and relay nodes
    #[arg(short, long)]
    config: PathBuf,

    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

fn init_logging(debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Token cancelled on Ctrl+C
fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => warn!("Cannot listen for Ctrl+C: {}", e),
        }
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Client(args) => run_client(args).await,
        Commands::Registry(args) => run_registry(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = args.into_config()?;
    info!(
        "Starting relay node {} (gateway {}, {})",
        env!("GIT_TAG"),
        config.gateway,
        if config.tap { "tap" } else { "tun" }
    );

    let mut server = RelayServer::new(config.clone());
    if config.gateway_device {
        server = server.with_gateway_interface(
            system_provider(config.device.clone()),
            Arc::new(SystemConfigurator::new()),
        );
    }

    let shutdown = shutdown_signal();
    tokio::select! {
        result = server.run() => result.context("Relay node failed")?,
        _ = shutdown.cancelled() => {}
    }
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let interface_index = args.interface_index;
    let config = args.into_config()?;

    let mut configurator = SystemConfigurator::new();
    if let Some(index) = interface_index {
        configurator = configurator.with_interface_index(index);
    }

    let provider = system_provider(config.device.clone());
    let registry = config.registry.clone();
    let mut engine = SessionEngine::new(config, provider, Arc::new(configurator));
    if let Some(registry) = registry {
        let client = RegistryClient::new(&registry.url, registry.token)
            .context("Failed to create registry client")?;
        info!("Discovering relay nodes via {}", client.access_url());
        engine = engine.with_discovery(Arc::new(client));
    }

    engine
        .run(shutdown_signal())
        .await
        .context("Tunnel client stopped")?;
    info!("Tunnel client stopped");
    Ok(())
}

async fn run_registry(args: RegistryArgs) -> Result<()> {
    let mut config = RegistryConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let selector = NodeSelector::with_nodes(config.relay_nodes());
    if selector.is_empty() {
        warn!("No relay nodes configured; every discovery request will fail");
    }
    info!(
        "Registry serving {} relay nodes, {} tokens",
        selector.len(),
        config.tokens.len()
    );

    let state = RegistryState::new(
        Arc::new(selector),
        Arc::new(StaticTokenValidator::new(config.tokens)),
    );

    let shutdown = shutdown_signal();
    tokio::select! {
        result = RegistryServer::new(config.listen, state).start() => result.context("Registry failed")?,
        _ = shutdown.cancelled() => {}
    }
    Ok(())
}
