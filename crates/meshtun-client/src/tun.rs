//! Linux TUN/TAP devices via `/dev/net/tun`

use crate::interface::{InterfaceError, InterfaceMode, InterfaceProvider, VirtualInterface};
use async_trait::async_trait;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::info;

const TUN_DEVICE: &[u8] = b"/dev/net/tun\0";

/// `_IOW('T', 202, int)`
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// `struct ifreq` restricted to the name and flags members
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: Option<&str>, flags: libc::c_short) -> io::Result<Self> {
        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags,
            _pad: [0; 22],
        };
        if let Some(name) = name {
            let bytes = name.as_bytes();
            if bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid interface name {:?}", name),
                ));
            }
            for (dst, src) in req.name.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
        }
        Ok(req)
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Opens kernel TUN/TAP devices
pub struct LinuxTunProvider {
    name: Option<String>,
}

impl LinuxTunProvider {
    pub fn new(name: Option<String>) -> Self {
        Self { name }
    }
}

#[async_trait]
impl InterfaceProvider for LinuxTunProvider {
    async fn create(
        &self,
        mode: InterfaceMode,
    ) -> Result<Arc<dyn VirtualInterface>, InterfaceError> {
        let device = LinuxTun::open(self.name.as_deref(), mode)?;
        info!("Created {:?} interface {}", mode, device.name);
        Ok(Arc::new(device))
    }
}

pub struct LinuxTun {
    name: String,
    fd: AsyncFd<OwnedFd>,
    closed: CancellationToken,
}

impl LinuxTun {
    pub fn open(name: Option<&str>, mode: InterfaceMode) -> io::Result<Self> {
        let flags = match mode {
            InterfaceMode::Tun => IFF_TUN,
            InterfaceMode::Tap => IFF_TAP,
        } | IFF_NO_PI;
        let mut req = IfReq::new(name, flags)?;

        let raw = unsafe {
            libc::open(
                TUN_DEVICE.as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            name: req.name(),
            fd: AsyncFd::new(fd)?,
            closed: CancellationToken::new(),
        })
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "interface closed")
    }
}

#[async_trait]
impl VirtualInterface for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = tokio::select! {
                _ = self.closed.cancelled() => return Err(Self::closed_error()),
                guard = self.fd.readable() => guard?,
            };

            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });

            match result {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        loop {
            if self.closed.is_cancelled() {
                return Err(Self::closed_error());
            }
            let mut guard = self.fd.writable().await?;

            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });

            match result {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
