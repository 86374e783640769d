//! Relay node server

use crate::config::ServerConfig;
use crate::gateway::{GatewayError, GatewayInterface};
use crate::pool::IpPool;
use crate::routes::routes_router;
use crate::session::{handle_connection, ServerContext, SessionError};
use crate::switch::{Switch, SwitchMode};
use meshtun_client::{InterfaceProvider, NetworkConfigurator};
use meshtun_relay::{ActivePolicy, ReverseProxy};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    Bind { address: SocketAddr, reason: String },

    #[error("Gateway interface error: {0}")]
    Gateway(#[from] GatewayError),
}

pub struct RelayServer {
    config: ServerConfig,
    gateway: Option<(Arc<dyn InterfaceProvider>, Arc<dyn NetworkConfigurator>)>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            gateway: None,
        }
    }

    /// Bring up a local interface at the gateway address for routed traffic
    pub fn with_gateway_interface(
        mut self,
        provider: Arc<dyn InterfaceProvider>,
        configurator: Arc<dyn NetworkConfigurator>,
    ) -> Self {
        self.gateway = Some((provider, configurator));
        self
    }

    pub async fn run(self) -> Result<(), ServerError> {
        let listener = bind(self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve tunnel clients on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let config = self.config;
        let gateway = self.gateway;
        info!("Relay node listening on {}", listener.local_addr()?);

        if let Some(nameserver) = &config.nameserver {
            info!("Nameserver {} configured (not pushed to clients)", nameserver);
        }

        let _reverse = start_reverse_proxy(&config).await;
        let routes_port = start_routes_endpoint(&config).await?;

        let mode = if config.tap {
            SwitchMode::Tap
        } else {
            SwitchMode::Tun
        };
        let ctx = Arc::new(ServerContext {
            pool: IpPool::new(config.gateway),
            switch: Switch::new(mode),
            routes_port,
            config,
        });
        info!(
            "Leasing addresses from {}/24 in {:?} mode",
            ctx.pool.gateway(),
            mode
        );

        let _gateway = match gateway {
            Some((provider, configurator)) => Some(
                GatewayInterface::start(ctx.clone(), provider.as_ref(), configurator.as_ref())
                    .await?,
            ),
            None => {
                info!("No gateway interface; routed traffic is dropped");
                None
            }
        };

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("New connection from {}", peer);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        match handle_connection(stream, peer, ctx).await {
                            Ok(()) => {}
                            Err(SessionError::Protocol(meshtun_proto::CodecError::Closed)) => {
                                debug!("{} closed before authorizing", peer)
                            }
                            Err(e) => warn!("Session with {} ended: {}", peer, e),
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn bind(address: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(address)
        .await
        .map_err(|e| ServerError::Bind {
            address,
            reason: e.to_string(),
        })
}

async fn start_reverse_proxy(config: &ServerConfig) -> Vec<ActivePolicy> {
    let Some(path) = &config.reverse_file else {
        return Vec::new();
    };

    match ReverseProxy::from_file(path).await {
        Ok(proxy) => {
            info!(
                "Loaded {} reverse proxy rules from {}",
                proxy.policies().len(),
                path.display()
            );
            proxy.start().await
        }
        Err(e) => {
            error!("Reverse proxy disabled: {}", e);
            Vec::new()
        }
    }
}

/// Returns the bound port when the endpoint is running
async fn start_routes_endpoint(config: &ServerConfig) -> Result<Option<u16>, ServerError> {
    let (Some(http_addr), Some(route_file)) = (config.http_addr, config.route_file.clone()) else {
        if config.route_file.is_some() {
            warn!("Route file configured without an HTTP address; clients get no routes");
        }
        return Ok(None);
    };

    let listener = bind(http_addr).await?;
    let port = listener.local_addr()?.port();
    info!(
        "Serving route manifest {} on {}",
        route_file.display(),
        listener.local_addr()?
    );

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, routes_router(route_file)).await {
            error!("Route manifest endpoint stopped: {}", e);
        }
    });

    Ok(Some(port))
}
