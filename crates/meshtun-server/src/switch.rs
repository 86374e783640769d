//! Packet switch between client sessions
//!
//! TUN mode forwards IPv4 packets by destination address; destinations no
//! session owns go to the gateway interface when one is attached. TAP mode
//! learns source MAC addresses and floods frames whose destination is
//! broadcast, multicast or not yet learned.

use bytes::Bytes;
use dashmap::DashMap;
use meshtun_proto::Frame;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

pub type SessionId = u64;

type MacAddr = [u8; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchMode {
    Tun,
    Tap,
}

pub struct Switch {
    mode: SwitchMode,
    next_id: AtomicU64,
    sessions: DashMap<SessionId, mpsc::UnboundedSender<Frame>>,
    by_ip: DashMap<Ipv4Addr, SessionId>,
    by_mac: DashMap<MacAddr, SessionId>,
    /// Gateway interface session, 0 when none
    default_target: AtomicU64,
}

impl Switch {
    pub fn new(mode: SwitchMode) -> Self {
        Self {
            mode,
            next_id: AtomicU64::new(1),
            sessions: DashMap::new(),
            by_ip: DashMap::new(),
            by_mac: DashMap::new(),
            default_target: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> SwitchMode {
        self.mode
    }

    /// Attach a session reachable at `ip`, returning its id
    pub fn register(&self, ip: Ipv4Addr, queue: mpsc::UnboundedSender<Frame>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(id, queue);
        self.by_ip.insert(ip, id);
        id
    }

    /// Attach the relay's own interface at `ip`; unowned TUN destinations go here
    pub fn register_gateway(&self, ip: Ipv4Addr, queue: mpsc::UnboundedSender<Frame>) -> SessionId {
        let id = self.register(ip, queue);
        self.default_target.store(id, Ordering::SeqCst);
        id
    }

    pub fn unregister(&self, id: SessionId, ip: Ipv4Addr) {
        let _ = self
            .default_target
            .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);
        self.sessions.remove(&id);
        self.by_ip.remove_if(&ip, |_, owner| *owner == id);
        self.by_mac.retain(|_, owner| *owner != id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Forward a packet received from `from`, returning how many sessions got it
    pub fn forward(&self, from: SessionId, packet: Bytes) -> usize {
        match self.mode {
            SwitchMode::Tun => self.forward_ip(from, packet),
            SwitchMode::Tap => self.forward_ethernet(from, packet),
        }
    }

    fn forward_ip(&self, from: SessionId, packet: Bytes) -> usize {
        let Some(dst) = ipv4_destination(&packet) else {
            trace!("Dropping non-IPv4 packet ({} bytes)", packet.len());
            return 0;
        };

        let target = self
            .by_ip
            .get(&dst)
            .map(|entry| *entry)
            .or_else(|| match self.default_target.load(Ordering::SeqCst) {
                0 => None,
                id => Some(id),
            });
        match target {
            Some(id) if id != from => self.deliver(id, packet) as usize,
            _ => {
                trace!("No session for {}, dropping", dst);
                0
            }
        }
    }

    fn forward_ethernet(&self, from: SessionId, packet: Bytes) -> usize {
        if packet.len() < 14 {
            trace!("Dropping runt frame ({} bytes)", packet.len());
            return 0;
        }

        let mut dst: MacAddr = [0; 6];
        dst.copy_from_slice(&packet[0..6]);
        let mut src: MacAddr = [0; 6];
        src.copy_from_slice(&packet[6..12]);

        if src[0] & 0x01 == 0 {
            self.by_mac.insert(src, from);
        }

        // Group bit covers broadcast and multicast
        if dst[0] & 0x01 == 0 {
            let target = self.by_mac.get(&dst).map(|entry| *entry);
            if let Some(id) = target {
                if id == from {
                    return 0;
                }
                return self.deliver(id, packet) as usize;
            }
        }

        self.flood(from, packet)
    }

    fn flood(&self, from: SessionId, packet: Bytes) -> usize {
        let targets: Vec<SessionId> = self
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| *id != from)
            .collect();

        targets
            .into_iter()
            .filter(|id| self.deliver(*id, packet.clone()))
            .count()
    }

    fn deliver(&self, id: SessionId, packet: Bytes) -> bool {
        let queue = self.sessions.get(&id).map(|entry| entry.value().clone());
        match queue {
            Some(queue) => queue.send(Frame::data(packet)).is_ok(),
            None => false,
        }
    }
}

/// Destination address of an IPv4 packet
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}
