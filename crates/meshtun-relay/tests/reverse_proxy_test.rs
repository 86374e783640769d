//! End-to-end reverse proxy tests over loopback sockets

use meshtun_relay::{
    load_policies, ProxyLimits, ProxyProtocol, ReverseError, ReversePolicy, ReverseProxy,
};
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

async fn start_tcp_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn start_udp_echo() -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

#[tokio::test]
async fn test_rule_file_with_comment_and_udp_rule() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# proxy rules").unwrap();
    writeln!(file, "udp 127.0.0.1:5300->8.8.8.8:53").unwrap();

    let policies = load_policies(file.path()).await.unwrap();
    assert_eq!(
        policies,
        vec![ReversePolicy {
            protocol: ProxyProtocol::Udp,
            listen: "127.0.0.1:5300".to_string(),
            upstream: "8.8.8.8:53".to_string(),
        }]
    );
    println!("✓ Rule file parsed to a single UDP policy");
}

#[tokio::test]
async fn test_missing_rule_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = load_policies(dir.path().join("missing.rules")).await;
    assert!(matches!(result, Err(ReverseError::Io(_))));
}

#[tokio::test]
async fn test_tcp_rule_forwards_to_upstream() {
    let echo = start_tcp_echo().await;
    let proxy = ReverseProxy::new(vec![ReversePolicy {
        protocol: ProxyProtocol::Tcp,
        listen: "127.0.0.1:0".to_string(),
        upstream: echo.to_string(),
    }]);

    let active = proxy.start().await;
    assert_eq!(active.len(), 1);

    let mut client = TcpStream::connect(active[0].local_addr).await.unwrap();
    client.write_all(b"hello through proxy").await.unwrap();

    let mut buf = vec![0u8; 19];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("no echo")
        .unwrap();
    assert_eq!(&buf, b"hello through proxy");

    active[0].shutdown();
    println!("✓ TCP bytes relayed both ways");
}

#[tokio::test]
async fn test_udp_rule_replies_to_sender() {
    let echo = start_udp_echo().await;
    let proxy = ReverseProxy::new(vec![ReversePolicy {
        protocol: ProxyProtocol::Udp,
        listen: "127.0.0.1:0".to_string(),
        upstream: echo.to_string(),
    }]);

    let active = proxy.start().await;
    assert_eq!(active.len(), 1);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"dns query", active[0].local_addr)
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("no UDP reply")
        .unwrap();
    assert_eq!(&buf[..n], b"dns query");
    assert_eq!(from, active[0].local_addr);
}

#[tokio::test]
async fn test_bind_failure_leaves_other_rules_active() {
    let echo = start_tcp_echo().await;
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = occupied.local_addr().unwrap();

    let proxy = ReverseProxy::new(vec![
        ReversePolicy {
            protocol: ProxyProtocol::Tcp,
            listen: taken.to_string(),
            upstream: echo.to_string(),
        },
        ReversePolicy {
            protocol: ProxyProtocol::Tcp,
            listen: "127.0.0.1:0".to_string(),
            upstream: echo.to_string(),
        },
    ]);

    let active = proxy.start().await;
    assert_eq!(active.len(), 1);
    assert_ne!(active[0].local_addr, taken);
}

#[tokio::test]
async fn test_connection_limit_defers_extra_clients() {
    let echo = start_tcp_echo().await;
    let proxy = ReverseProxy::new(vec![ReversePolicy {
        protocol: ProxyProtocol::Tcp,
        listen: "127.0.0.1:0".to_string(),
        upstream: echo.to_string(),
    }])
    .with_limits(ProxyLimits {
        max_connections: Some(1),
    });

    let active = proxy.start().await;
    let addr = active[0].local_addr;

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    first.read_exact(&mut buf).await.unwrap();

    // Second client completes the TCP handshake via the backlog but is not served
    let mut second = TcpStream::connect(addr).await.unwrap();
    second.write_all(b"two").await.unwrap();
    let pending = timeout(Duration::from_millis(300), second.read_exact(&mut buf)).await;
    assert!(pending.is_err(), "second client served while at capacity");

    drop(first);
    timeout(Duration::from_secs(2), second.read_exact(&mut buf))
        .await
        .expect("second client never served")
        .unwrap();
    assert_eq!(&buf, b"two");
}
