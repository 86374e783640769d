//! The relay node's own interface at the gateway address
//!
//! Packets the switch hands to the gateway are written to the interface;
//! packets read from it are switched like any client's.

use crate::session::ServerContext;
use crate::switch::SessionId;
use bytes::Bytes;
use meshtun_client::{
    InterfaceError, InterfaceMode, InterfaceProvider, NetConfigError, NetworkConfigurator,
    VirtualInterface,
};
use meshtun_proto::Frame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to create gateway interface: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Failed to configure gateway interface: {0}")]
    Configure(#[from] NetConfigError),
}

/// Running gateway interface
pub struct GatewayInterface {
    iface: Arc<dyn VirtualInterface>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl GatewayInterface {
    /// Create the interface, give it the gateway address and attach it to the switch
    pub async fn start(
        ctx: Arc<ServerContext>,
        provider: &dyn InterfaceProvider,
        configurator: &dyn NetworkConfigurator,
    ) -> Result<Self, GatewayError> {
        let mode = InterfaceMode::from_tap_flag(ctx.config.tap);
        let iface = provider.create(mode).await?;
        let gateway = ctx.pool.gateway();
        let address = gateway.to_string();

        if let Err(e) = configurator
            .configure_interface(iface.name(), &address, &address)
            .await
        {
            iface.close().await;
            return Err(e.into());
        }
        info!("Gateway interface {} up at {}/24", iface.name(), gateway);

        let (queue, outbound) = mpsc::unbounded_channel();
        let id = ctx.switch.register_gateway(gateway, queue);

        let writer = tokio::spawn(write_loop(iface.clone(), outbound));
        let reader = {
            let iface = iface.clone();
            tokio::spawn(async move {
                read_loop(iface, id, &ctx).await;
                ctx.switch.unregister(id, gateway);
            })
        };

        Ok(Self {
            iface,
            reader,
            writer,
        })
    }

    pub async fn shutdown(self) {
        self.iface.close().await;
        let _ = self.reader.await;
        self.writer.abort();
    }
}

async fn read_loop(iface: Arc<dyn VirtualInterface>, id: SessionId, ctx: &ServerContext) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match iface.read_packet(&mut buf).await {
            Ok(n) => {
                ctx.switch.forward(id, Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                debug!("Gateway interface read stopped: {}", e);
                break;
            }
        }
    }
}

async fn write_loop(
    iface: Arc<dyn VirtualInterface>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = iface.write_packet(&frame.payload).await {
            warn!("Gateway interface write failed: {}", e);
        }
    }
}
