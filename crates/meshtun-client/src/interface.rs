//! Virtual network interface abstraction
//!
//! A session reads outbound packets from the interface and writes inbound
//! packets to it concurrently, so both operations take `&self`. Closing an
//! interface makes every pending and future read fail.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("Failed to open interface: {0}")]
    Open(#[from] io::Error),

    #[error("Virtual interfaces are not supported on {0}")]
    Unsupported(&'static str),
}

/// Layer of the virtual interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceMode {
    /// IP packets
    Tun,
    /// Ethernet frames
    Tap,
}

impl InterfaceMode {
    pub fn from_tap_flag(tap: bool) -> Self {
        if tap {
            InterfaceMode::Tap
        } else {
            InterfaceMode::Tun
        }
    }
}

#[async_trait]
pub trait VirtualInterface: Send + Sync {
    fn name(&self) -> &str;

    /// Read one packet into `buf`, returning its length
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait InterfaceProvider: Send + Sync {
    async fn create(&self, mode: InterfaceMode)
        -> Result<Arc<dyn VirtualInterface>, InterfaceError>;
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "interface closed")
}

/// In-memory interface backed by channels
pub struct ChannelInterface {
    name: String,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

/// The far side of a [`ChannelInterface`]
pub struct ChannelHandle {
    name: String,
    inject: mpsc::UnboundedSender<Bytes>,
    written: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
}

impl ChannelInterface {
    pub fn pair(name: impl Into<String>) -> (ChannelInterface, ChannelHandle) {
        let name = name.into();
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, written) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let iface = ChannelInterface {
            name: name.clone(),
            inbound: Mutex::new(inbound),
            outbound,
            closed: closed.clone(),
        };
        let handle = ChannelHandle {
            name,
            inject,
            written,
            closed,
        };
        (iface, handle)
    }
}

#[async_trait]
impl VirtualInterface for ChannelInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = tokio::select! {
            _ = self.closed.cancelled() => return Err(closed_error()),
            packet = async { self.inbound.lock().await.recv().await } => packet,
        };

        match packet {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Err(closed_error()),
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.outbound
            .send(Bytes::copy_from_slice(packet))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface peer gone"))
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a packet to the interface as if the OS had routed it there
    pub fn inject(&self, packet: impl Into<Bytes>) -> bool {
        self.inject.send(packet.into()).is_ok()
    }

    /// Next packet the session wrote to the interface
    pub async fn next_written(&mut self) -> Option<Bytes> {
        self.written.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Provider creating [`ChannelInterface`]s, handing their far ends to a receiver
pub struct ChannelProvider {
    handles: mpsc::UnboundedSender<ChannelHandle>,
    counter: std::sync::atomic::AtomicU32,
}

impl ChannelProvider {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelHandle>) {
        let (handles, rx) = mpsc::unbounded_channel();
        let provider = Self {
            handles,
            counter: std::sync::atomic::AtomicU32::new(0),
        };
        (provider, rx)
    }
}

#[async_trait]
impl InterfaceProvider for ChannelProvider {
    async fn create(
        &self,
        _mode: InterfaceMode,
    ) -> Result<Arc<dyn VirtualInterface>, InterfaceError> {
        let index = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (iface, handle) = ChannelInterface::pair(format!("mem{}", index));
        // Receiver may be gone; the interface still works
        let _ = self.handles.send(handle);
        Ok(Arc::new(iface))
    }
}

/// Provider for the host OS
pub fn system_provider(name: Option<String>) -> Arc<dyn InterfaceProvider> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(crate::tun::LinuxTunProvider::new(name))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
        Arc::new(UnsupportedProvider)
    }
}

#[cfg(not(target_os = "linux"))]
struct UnsupportedProvider;

#[cfg(not(target_os = "linux"))]
#[async_trait]
impl InterfaceProvider for UnsupportedProvider {
    async fn create(
        &self,
        _mode: InterfaceMode,
    ) -> Result<Arc<dyn VirtualInterface>, InterfaceError> {
        Err(InterfaceError::Unsupported(std::env::consts::OS))
    }
}
