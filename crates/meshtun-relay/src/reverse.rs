//! Static reverse proxy
//!
//! Rules come from a plain text file, one per line:
//!
//! ```text
//! # comment
//! tcp 0.0.0.0:8080->10.8.0.12:80
//! udp 127.0.0.1:5300->8.8.8.8:53
//! ```
//!
//! Lines that do not parse are skipped. Each rule gets its own listener; a
//! rule whose listener cannot bind stays inactive without affecting others.

use crate::engine::{relay, relay_datagrams};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timeout for dialing a TCP upstream
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReverseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {protocol} listener on {address}: {reason}")]
    Bind {
        protocol: ProxyProtocol,
        address: String,
        reason: String,
    },

    #[error("Could not resolve upstream {0}")]
    Resolve(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyProtocol {
    Tcp,
    Udp,
}

impl FromStr for ProxyProtocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ProxyProtocol::Tcp),
            "udp" => Ok(ProxyProtocol::Udp),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Tcp => write!(f, "tcp"),
            ProxyProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// One forwarding rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversePolicy {
    pub protocol: ProxyProtocol,
    pub listen: String,
    pub upstream: String,
}

impl fmt::Display for ReversePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}->{}", self.protocol, self.listen, self.upstream)
    }
}

/// Parse a single rule line, `None` for comments and malformed lines
pub fn parse_policy_line(line: &str) -> Option<ReversePolicy> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 2 {
        return None;
    }

    let protocol = tokens[0].parse::<ProxyProtocol>().ok()?;

    let addrs: Vec<&str> = tokens[1].split("->").collect();
    if addrs.len() != 2 || addrs[0].is_empty() || addrs[1].is_empty() {
        return None;
    }

    Some(ReversePolicy {
        protocol,
        listen: addrs[0].to_string(),
        upstream: addrs[1].to_string(),
    })
}

/// Parse rule file content, keeping file order
pub fn parse_policies(content: &str) -> Vec<ReversePolicy> {
    content
        .lines()
        .filter_map(|line| {
            let policy = parse_policy_line(line);
            if policy.is_none() {
                let trimmed = line.trim();
                if !trimmed.is_empty() && !trimmed.starts_with('#') {
                    debug!("Skipping malformed proxy rule: {}", trimmed);
                }
            }
            policy
        })
        .collect()
}

/// Read and parse a rule file
pub async fn load_policies(path: impl AsRef<Path>) -> Result<Vec<ReversePolicy>, ReverseError> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    Ok(parse_policies(&content))
}

/// Per-rule resource limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyLimits {
    /// Cap on concurrent TCP connections per rule, unlimited when `None`
    pub max_connections: Option<usize>,
}

/// A rule whose listener is bound and serving
pub struct ActivePolicy {
    pub policy: ReversePolicy,
    pub local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ActivePolicy {
    pub fn shutdown(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl fmt::Debug for ActivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePolicy")
            .field("policy", &self.policy)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

pub struct ReverseProxy {
    policies: Vec<ReversePolicy>,
    limits: ProxyLimits,
}

impl ReverseProxy {
    pub fn new(policies: Vec<ReversePolicy>) -> Self {
        Self {
            policies,
            limits: ProxyLimits::default(),
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ReverseError> {
        Ok(Self::new(load_policies(path).await?))
    }

    pub fn with_limits(mut self, limits: ProxyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn policies(&self) -> &[ReversePolicy] {
        &self.policies
    }

    /// Bind every rule and start serving
    ///
    /// Returns the rules that bound successfully; failures are logged.
    pub async fn start(&self) -> Vec<ActivePolicy> {
        let mut active = Vec::with_capacity(self.policies.len());

        for policy in &self.policies {
            let started = match policy.protocol {
                ProxyProtocol::Tcp => start_tcp(policy.clone(), self.limits).await,
                ProxyProtocol::Udp => start_udp(policy.clone()).await,
            };

            match started {
                Ok(entry) => {
                    info!("Reverse proxy {} listening on {}", policy, entry.local_addr);
                    active.push(entry);
                }
                Err(e) => error!("Reverse proxy {} inactive: {}", policy, e),
            }
        }

        active
    }
}

async fn start_tcp(
    policy: ReversePolicy,
    limits: ProxyLimits,
) -> Result<ActivePolicy, ReverseError> {
    let listener = TcpListener::bind(policy.listen.as_str())
        .await
        .map_err(|e| ReverseError::Bind {
            protocol: policy.protocol,
            address: policy.listen.clone(),
            reason: e.to_string(),
        })?;
    let local_addr = listener.local_addr()?;

    let upstream = policy.upstream.clone();
    let permits = limits.max_connections.map(|n| Arc::new(Semaphore::new(n)));

    let handle = tokio::spawn(async move {
        loop {
            // Hold off accepting while the rule is at capacity
            let permit = match &permits {
                Some(semaphore) => match semaphore.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                None => None,
            };

            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New TCP connection from {} for {}", peer_addr, upstream);
                    let upstream = upstream.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_tcp_connection(stream, peer_addr, &upstream).await {
                            warn!("Proxy connection from {} failed: {}", peer_addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    });

    Ok(ActivePolicy {
        policy,
        local_addr,
        handle,
    })
}

async fn handle_tcp_connection(
    client: TcpStream,
    peer_addr: SocketAddr,
    upstream: &str,
) -> Result<(), ReverseError> {
    let server = tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(upstream))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {} timed out", upstream),
            )
        })??;

    let stats = relay(client, server).await;
    debug!(
        "Proxy connection {} <-> {} closed ({} bytes up, {} bytes down)",
        peer_addr, upstream, stats.a_to_b, stats.b_to_a
    );
    Ok(())
}

async fn start_udp(policy: ReversePolicy) -> Result<ActivePolicy, ReverseError> {
    let listener = UdpSocket::bind(policy.listen.as_str())
        .await
        .map_err(|e| ReverseError::Bind {
            protocol: policy.protocol,
            address: policy.listen.clone(),
            reason: e.to_string(),
        })?;
    let local_addr = listener.local_addr()?;

    let target = tokio::net::lookup_host(policy.upstream.as_str())
        .await?
        .next()
        .ok_or_else(|| ReverseError::Resolve(policy.upstream.clone()))?;
    let unspecified: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let upstream = UdpSocket::bind(unspecified).await?;
    upstream.connect(target).await?;

    let label = policy.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = relay_datagrams(listener, upstream).await {
            error!("UDP proxy {} stopped: {}", label, e);
        }
    });

    Ok(ActivePolicy {
        policy,
        local_addr,
        handle,
    })
}
