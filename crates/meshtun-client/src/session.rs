//! Session engine
//!
//! One attempt runs discovery, dial, authorize, interface setup and then the
//! active phase. The active phase is four tasks sharing one outbound queue:
//!
//! - interface reader: packets from the interface become tunnel-data frames
//! - sender: drains the queue onto the socket
//! - heartbeat: enqueues a client heartbeat every interval
//! - receiver: frames from the socket, tunnel-data goes to the interface
//!
//! Sender, heartbeat and receiver watch one shutdown token; the reader only
//! stops once the interface is closed. When the attempt ends the engine
//! starts a new one, forever, until the caller's stop token fires.

use crate::config::ClientConfig;
use crate::discovery::{DiscoveryClient, DiscoveryError};
use crate::interface::{InterfaceError, InterfaceMode, InterfaceProvider, VirtualInterface};
use crate::netconfig::{NetConfigError, NetworkConfigurator};
use crate::routes::{apply_routes, fetch_routes};
use bytes::Bytes;
use meshtun_proto::{
    read_frame, AuthorizeRequest, AuthorizeResponse, CodecError, Command, Frame,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Largest packet read from the interface
const INTERFACE_READ_BUFFER: usize = 64 * 1024;

/// How long Closing waits for the interface reader after the interface closed
const READER_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("No relay address available")]
    NoServer,

    #[error("Failed to connect to {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Authorization timed out")]
    AuthorizeTimeout,

    #[error("Unexpected command during authorization: {0:?}")]
    UnexpectedCommand(Command),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to create virtual interface: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Failed to configure interface: {0}")]
    Configure(#[from] NetConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Discovering,
    Connecting { server: String },
    Authorizing { server: String },
    Active {
        server: String,
        access_ip: String,
        gateway: String,
    },
    Closing,
}

pub struct SessionEngine {
    config: ClientConfig,
    provider: Arc<dyn InterfaceProvider>,
    configurator: Arc<dyn NetworkConfigurator>,
    discovery: Option<Arc<dyn DiscoveryClient>>,
    http: reqwest::Client,
    state: watch::Sender<SessionState>,
}

impl SessionEngine {
    pub fn new(
        config: ClientConfig,
        provider: Arc<dyn InterfaceProvider>,
        configurator: Arc<dyn NetworkConfigurator>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            provider,
            configurator,
            discovery: None,
            http: reqwest::Client::new(),
            state,
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryClient>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn set_state(&self, state: SessionState) {
        trace!("Session state -> {:?}", state);
        self.state.send_replace(state);
    }

    /// Run sessions until `stop` fires
    ///
    /// Only an interface creation failure ends the loop with an error.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), SessionError> {
        loop {
            if stop.is_cancelled() {
                break;
            }

            let attempt = Uuid::new_v4();
            let span = info_span!("session", attempt = %attempt);
            let result = self.run_attempt(&stop).instrument(span).await;
            self.set_state(SessionState::Disconnected);

            match result {
                Ok(()) => info!("Session ended, reconnecting"),
                Err(e @ SessionError::Interface(_)) => {
                    error!("{}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Session attempt failed: {}", e);
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }

        info!("Session engine stopped");
        Ok(())
    }

    async fn run_attempt(&self, stop: &CancellationToken) -> Result<(), SessionError> {
        let established = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            established = self.establish() => established?,
        };
        let (server, reader, writer, assignment) = established;

        info!(
            "Connected to {}, assigned {} (gateway {})",
            server, assignment.access_ip, assignment.gateway
        );

        let mode = InterfaceMode::from_tap_flag(self.config.tap);
        let iface = self.provider.create(mode).await?;
        let name = iface.name().to_string();

        if let Err(e) = self
            .configurator
            .configure_interface(&name, &assignment.access_ip, &assignment.gateway)
            .await
        {
            iface.close().await;
            return Err(e.into());
        }

        self.set_state(SessionState::Active {
            server,
            access_ip: assignment.access_ip.clone(),
            gateway: assignment.gateway.clone(),
        });

        if let Some(url) = assignment.route_url() {
            self.spawn_route_install(url.to_string(), &name, &assignment);
        }

        let reader_task = self
            .run_active(reader, writer, iface.clone(), stop.child_token())
            .await;

        self.set_state(SessionState::Closing);
        if let Err(e) = self
            .configurator
            .release_interface(&name, &assignment.access_ip, &assignment.gateway)
            .await
        {
            warn!("Failed to release interface {}: {}", name, e);
        }
        iface.close().await;

        if tokio::time::timeout(READER_EXIT_TIMEOUT, reader_task)
            .await
            .is_err()
        {
            warn!("Interface reader did not stop after close");
        }

        Ok(())
    }

    /// Discovery, dial and authorize
    async fn establish(
        &self,
    ) -> Result<(String, OwnedReadHalf, OwnedWriteHalf, AuthorizeResponse), SessionError> {
        self.set_state(SessionState::Discovering);
        let server = self.resolve_server().await?;

        self.set_state(SessionState::Connecting {
            server: server.clone(),
        });
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&server))
            .await
            .map_err(|_| SessionError::ConnectTimeout(server.clone()))?
            .map_err(|source| SessionError::Connect {
                server: server.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        self.set_state(SessionState::Authorizing {
            server: server.clone(),
        });
        let (mut reader, mut writer) = stream.into_split();
        let assignment = tokio::time::timeout(
            self.config.authorize_timeout,
            authorize(&mut reader, &mut writer, &self.config.key),
        )
        .await
        .map_err(|_| SessionError::AuthorizeTimeout)??;

        Ok((server, reader, writer, assignment))
    }

    async fn resolve_server(&self) -> Result<String, SessionError> {
        if let Some(discovery) = &self.discovery {
            match discovery.discover().await {
                Ok(server) => {
                    debug!("Registry assigned relay {}", server);
                    return Ok(server);
                }
                Err(e) if self.config.must_discover() => return Err(e.into()),
                Err(e) => warn!("Discovery failed, using static server: {}", e),
            }
        }

        self.config
            .server
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(SessionError::NoServer)
    }

    fn spawn_route_install(&self, url: String, name: &str, assignment: &AuthorizeResponse) {
        let http = self.http.clone();
        let configurator = self.configurator.clone();
        let name = name.to_string();
        let ip = assignment.access_ip.clone();
        let gateway = assignment.gateway.clone();

        tokio::spawn(async move {
            match fetch_routes(&http, &url).await {
                Ok(routes) => {
                    apply_routes(configurator.as_ref(), &routes, &name, &ip, &gateway).await;
                }
                Err(e) => warn!("Route manifest from {} unavailable: {}", url, e),
            }
        });
    }

    /// Runs until sender, heartbeat and receiver have stopped
    ///
    /// Returns the interface reader, which is still running.
    async fn run_active(
        &self,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        iface: Arc<dyn VirtualInterface>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let (queue, outbound) = mpsc::unbounded_channel::<Frame>();

        let reader_task = tokio::spawn(interface_reader(iface.clone(), queue.clone()));

        let mut tasks = JoinSet::new();
        tasks.spawn(sender(
            writer,
            outbound,
            shutdown.clone(),
            self.config.write_timeout,
        ));
        tasks.spawn(heartbeat(
            queue,
            shutdown.clone(),
            self.config.heartbeat_interval,
        ));
        tasks.spawn(receiver(reader, iface, shutdown));

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Session task failed: {}", e);
            }
        }

        reader_task
    }
}

async fn authorize<R, W>(
    reader: &mut R,
    writer: &mut W,
    key: &str,
) -> Result<AuthorizeResponse, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = Frame::json(Command::ClientAuthorize, &AuthorizeRequest::for_host(key))?;
    writer.write_all(&request.encode()?).await?;

    let reply = read_frame(reader).await?;
    if reply.command != Command::ServerAuthorize {
        return Err(SessionError::UnexpectedCommand(reply.command));
    }
    Ok(reply.parse_json()?)
}

async fn interface_reader(iface: Arc<dyn VirtualInterface>, queue: mpsc::UnboundedSender<Frame>) {
    let mut buf = vec![0u8; INTERFACE_READ_BUFFER];
    loop {
        let n = match iface.read_packet(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!("Interface read stopped: {}", e);
                break;
            }
        };
        if queue
            .send(Frame::data(Bytes::copy_from_slice(&buf[..n])))
            .is_err()
        {
            break;
        }
    }
}

async fn sender(
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
                warn!("Send failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("Send timed out after {:?}", write_timeout);
                break;
            }
        }
    }

    drop(writer);
    shutdown.cancel();
}

async fn heartbeat(
    queue: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if queue.send(Frame::client_heartbeat()).is_err() {
                    break;
                }
            }
        }
    }
}

async fn receiver(
    mut reader: OwnedReadHalf,
    iface: Arc<dyn VirtualInterface>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(frame) => match frame.command {
                Command::ServerHeartbeat => debug!("Heartbeat from relay"),
                Command::TunnelData => {
                    if let Err(e) = iface.write_packet(&frame.payload).await {
                        warn!("Interface write failed: {}", e);
                    }
                }
                other => info!("Ignoring unexpected command {:?}", other),
            },
            Err(CodecError::Closed) => {
                info!("Relay closed the connection");
                break;
            }
            Err(e) => {
                warn!("Receive failed: {}", e);
                break;
            }
        }
    }

    shutdown.cancel();
}
