//! Per-client session on the relay node

use crate::config::ServerConfig;
use crate::pool::IpPool;
use crate::switch::{SessionId, Switch};
use meshtun_proto::{read_frame, AuthorizeRequest, AuthorizeResponse, CodecError, Command, Frame};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// State shared by every session on one relay node
pub struct ServerContext {
    pub config: ServerConfig,
    pub pool: IpPool,
    pub switch: Switch,
    /// Port of the route manifest endpoint, when it is running
    pub routes_port: Option<u16>,
}

impl ServerContext {
    /// Manifest URL as seen by a client connected through `local_ip`
    pub fn route_url(&self, local_ip: IpAddr) -> String {
        let Some(port) = self.routes_port else {
            return String::new();
        };

        let host = match (&self.config.public_host, self.config.http_addr) {
            (Some(host), _) => host.clone(),
            (None, Some(addr)) if !addr.ip().is_unspecified() => addr.ip().to_string(),
            _ => local_ip.to_string(),
        };
        format!("http://{}:{}{}", host, port, meshtun_proto::ROUTES_PATH)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Authorization timed out")]
    AuthorizeTimeout,

    #[error("Expected authorize request, got {0:?}")]
    UnexpectedCommand(Command),

    #[error("Invalid key from {0}")]
    InvalidKey(SocketAddr),

    #[error("Address pool exhausted")]
    PoolExhausted,

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), SessionError> {
    let _ = stream.set_nodelay(true);
    let local_ip = stream.local_addr()?.ip();
    let (mut reader, mut writer) = stream.into_split();

    let request = tokio::time::timeout(ctx.config.authorize_timeout, read_frame(&mut reader))
        .await
        .map_err(|_| SessionError::AuthorizeTimeout)??;
    if request.command != Command::ClientAuthorize {
        return Err(SessionError::UnexpectedCommand(request.command));
    }
    let request: AuthorizeRequest = request.parse_json()?;

    if !ctx.config.accepts_key(&request.key) {
        return Err(SessionError::InvalidKey(peer));
    }

    let ip = ctx.pool.lease().ok_or(SessionError::PoolExhausted)?;
    let reply = AuthorizeResponse {
        access_ip: ip.to_string(),
        gateway: ctx.pool.gateway().to_string(),
        route_script_url: ctx.route_url(local_ip),
    };

    let sent = async {
        let frame = Frame::json(Command::ServerAuthorize, &reply)?;
        writer.write_all(&frame.encode()?).await?;
        Ok::<(), SessionError>(())
    }
    .await;
    if let Err(e) = sent {
        ctx.pool.release(ip);
        return Err(e);
    }

    info!(
        "Client {} ({} {}) assigned {}",
        peer, request.platform, request.version, ip
    );

    let (queue, outbound) = mpsc::unbounded_channel();
    let id = ctx.switch.register(ip, queue.clone());
    let shutdown = CancellationToken::new();

    let writer_task = tokio::spawn(write_loop(
        writer,
        outbound,
        shutdown.clone(),
        ctx.config.write_timeout,
    ));

    read_loop(reader, id, &queue, &ctx, &shutdown, peer).await;

    shutdown.cancel();
    let _ = writer_task.await;
    ctx.switch.unregister(id, ip);
    ctx.pool.release(ip);
    info!("Client {} ({}) disconnected", peer, ip);
    Ok(())
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    id: SessionId,
    queue: &mpsc::UnboundedSender<Frame>,
    ctx: &ServerContext,
    shutdown: &CancellationToken,
    peer: SocketAddr,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(frame) => match frame.command {
                Command::ClientHeartbeat => {
                    trace!("Heartbeat from {}", peer);
                    if queue.send(Frame::server_heartbeat()).is_err() {
                        break;
                    }
                }
                Command::TunnelData => {
                    ctx.switch.forward(id, frame.payload);
                }
                other => debug!("Ignoring command {:?} from {}", other, peer),
            },
            Err(CodecError::Closed) => break,
            Err(e) => {
                warn!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping unencodable frame: {}", e);
                continue;
            }
        };

        match tokio::time::timeout(write_timeout, writer.write_all(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("Write timed out after {:?}", write_timeout);
                break;
            }
        }
    }

    // Stops the read loop too
    shutdown.cancel();
}

