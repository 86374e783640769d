//! Relay engine
//!
//! `relay` pumps bytes in both directions between two established streams.
//! When either direction stops (EOF or error) both streams are shut down and
//! the call returns after both pumps have exited.

use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Transfer buffer used by each stream direction (16KB)
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Largest UDP datagram we relay
const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte counters for one relay invocation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy data bidirectionally between `a` and `b`
///
/// Returns once both directions have stopped. Neither direction is ordered
/// relative to the other.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let stop = CancellationToken::new();

    let (a_to_b, b_to_a) = tokio::join!(
        pump(&mut a_read, &mut b_write, &stop, "a->b"),
        pump(&mut b_read, &mut a_write, &stop, "b->a"),
    );

    RelayStats { a_to_b, b_to_a }
}

/// One direction of the relay. Stops the other direction when it exits.
async fn pump<R, W>(reader: &mut R, writer: &mut W, stop: &CancellationToken, label: &str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = stop.cancelled() => break,
            result = reader.read(&mut buffer) => match result {
                Ok(0) => {
                    trace!("{}: end of stream", label);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("{}: read failed: {}", label, e);
                    break;
                }
            },
        };

        if let Err(e) = writer.write_all(&buffer[..n]).await {
            debug!("{}: write to peer failed: {}", label, e);
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    stop.cancel();
    total
}

/// Relay datagrams between a bound listener and a connected upstream socket
///
/// Every datagram received on `listener` is forwarded upstream and the sender
/// is remembered; datagrams coming back from upstream go to the most recent
/// sender. Runs until the listener fails.
pub async fn relay_datagrams(
    listener: UdpSocket,
    upstream: UdpSocket,
) -> Result<RelayStats, RelayError> {
    let mut inbound = vec![0u8; DATAGRAM_BUFFER_SIZE];
    let mut outbound = vec![0u8; DATAGRAM_BUFFER_SIZE];
    let mut last_peer: Option<SocketAddr> = None;
    let mut stats = RelayStats::default();

    loop {
        tokio::select! {
            result = listener.recv_from(&mut inbound) => {
                let (n, peer) = result?;
                last_peer = Some(peer);
                match upstream.send(&inbound[..n]).await {
                    Ok(sent) => stats.a_to_b += sent as u64,
                    Err(e) => warn!("Failed to forward datagram from {}: {}", peer, e),
                }
            }
            result = upstream.recv(&mut outbound) => {
                let n = match result {
                    Ok(n) => n,
                    Err(e) => {
                        // ICMP errors surface here on connected sockets
                        debug!("Upstream receive failed: {}", e);
                        continue;
                    }
                };
                match last_peer {
                    Some(peer) => {
                        listener.send_to(&outbound[..n], peer).await?;
                        stats.b_to_a += n as u64;
                    }
                    None => trace!("Dropping {} byte upstream datagram, no client yet", n),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_relay_forwards_both_directions() {
        let (mut client, a) = tokio::io::duplex(64);
        let (b, mut upstream) = tokio::io::duplex(64);

        let relay_task = tokio::spawn(relay(a, b));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        let stats = tokio::time::timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay did not stop")
            .unwrap();
        assert_eq!(stats, RelayStats { a_to_b: 4, b_to_a: 5 });
    }

    #[tokio::test]
    async fn test_relay_closes_other_side_on_eof() {
        let (client, a) = tokio::io::duplex(64);
        let (b, mut upstream) = tokio::io::duplex(64);

        let relay_task = tokio::spawn(relay(a, b));
        drop(client);

        // Upstream observes EOF even though it never closed its own side
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(1), upstream.read_to_end(&mut buf))
            .await
            .expect("upstream never saw EOF")
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay did not stop")
            .unwrap();
    }
}
