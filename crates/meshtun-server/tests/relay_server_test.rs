//! Relay node integration tests over real loopback sockets

use async_trait::async_trait;
use meshtun_client::{ChannelProvider, NetConfigError, NetworkConfigurator};
use meshtun_proto::{read_frame, AuthorizeRequest, AuthorizeResponse, CodecError, Command, Frame};
use meshtun_server::{RelayServer, ServerConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

async fn start_server(config: ServerConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(RelayServer::new(config).serve(listener));
    addr
}

fn test_config() -> ServerConfig {
    ServerConfig {
        key: "secret".to_string(),
        ..Default::default()
    }
}

async fn send(stream: &mut TcpStream, frame: Frame) {
    stream.write_all(&frame.encode().unwrap()).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> Result<Frame, CodecError> {
    tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
        .await
        .expect("timed out waiting for frame")
}

async fn authorize(addr: SocketAddr, key: &str) -> (TcpStream, AuthorizeResponse) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = Frame::json(Command::ClientAuthorize, &AuthorizeRequest::for_host(key)).unwrap();
    send(&mut stream, request).await;

    let reply = recv(&mut stream).await.unwrap();
    assert_eq!(reply.command, Command::ServerAuthorize);
    let response = reply.parse_json().unwrap();
    (stream, response)
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut packet = vec![0u8; 40];
    packet[0] = 0x45;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(b"hello through the tunnel");
    packet
}

#[tokio::test]
async fn test_clients_get_sequential_addresses() {
    let addr = start_server(test_config()).await;

    let (_a, first) = authorize(addr, "secret").await;
    let (_b, second) = authorize(addr, "secret").await;

    assert_eq!(first.access_ip, "10.8.0.2");
    assert_eq!(second.access_ip, "10.8.0.3");
    assert_eq!(first.gateway, "10.8.0.1");
    assert_eq!(first.route_url(), None);
}

#[tokio::test]
async fn test_heartbeat_is_answered() {
    let addr = start_server(test_config()).await;
    let (mut stream, _) = authorize(addr, "secret").await;

    send(&mut stream, Frame::client_heartbeat()).await;
    let reply = recv(&mut stream).await.unwrap();
    assert_eq!(reply.command, Command::ServerHeartbeat);
    assert!(reply.payload.is_empty());
}

#[tokio::test]
async fn test_packets_switched_between_clients() {
    let addr = start_server(test_config()).await;
    let (mut a, lease_a) = authorize(addr, "secret").await;
    let (mut b, lease_b) = authorize(addr, "secret").await;

    let src: Ipv4Addr = lease_a.access_ip.parse().unwrap();
    let dst: Ipv4Addr = lease_b.access_ip.parse().unwrap();
    let packet = ipv4_packet(src, dst);
    send(&mut a, Frame::data(packet.clone())).await;

    let frame = recv(&mut b).await.unwrap();
    assert_eq!(frame.command, Command::TunnelData);
    assert_eq!(&frame.payload[..], &packet[..]);

    // And back the other way
    let reply = ipv4_packet(dst, src);
    send(&mut b, Frame::data(reply.clone())).await;
    let frame = recv(&mut a).await.unwrap();
    assert_eq!(&frame.payload[..], &reply[..]);

    println!("✓ Packets switched {} <-> {}", src, dst);
}

#[tokio::test]
async fn test_wrong_key_closes_connection() {
    let addr = start_server(test_config()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = Frame::json(Command::ClientAuthorize, &AuthorizeRequest::for_host("nope")).unwrap();
    send(&mut stream, request).await;

    assert!(matches!(recv(&mut stream).await, Err(CodecError::Closed)));

    // The rejected client did not consume an address
    let (_ok, lease) = authorize(addr, "secret").await;
    assert_eq!(lease.access_ip, "10.8.0.2");
}

#[tokio::test]
async fn test_empty_key_accepts_any_client() {
    let addr = start_server(ServerConfig::default()).await;
    let (_stream, lease) = authorize(addr, "whatever").await;
    assert_eq!(lease.access_ip, "10.8.0.2");
}

#[tokio::test]
async fn test_non_authorize_first_frame_is_rejected() {
    let addr = start_server(test_config()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send(&mut stream, Frame::client_heartbeat()).await;
    assert!(matches!(recv(&mut stream).await, Err(CodecError::Closed)));
}

#[tokio::test]
async fn test_address_reused_after_disconnect() {
    let addr = start_server(test_config()).await;

    let (first, lease) = authorize(addr, "secret").await;
    assert_eq!(lease.access_ip, "10.8.0.2");
    drop(first);

    // Give the session a moment to notice the close
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_second, lease) = authorize(addr, "secret").await;
    assert_eq!(lease.access_ip, "10.8.0.2");
}

#[tokio::test]
async fn test_route_manifest_published() {
    let dir = tempfile::tempdir().unwrap();
    let route_file = dir.path().join("routes.txt");
    std::fs::write(&route_file, "1.0.0.0/8\n114.114.114.114/32\n").unwrap();

    let config = ServerConfig {
        route_file: Some(route_file),
        http_addr: Some("127.0.0.1:0".parse().unwrap()),
        ..test_config()
    };
    let addr = start_server(config).await;
    let (_stream, lease) = authorize(addr, "secret").await;

    let url = lease.route_url().unwrap();
    assert!(url.starts_with("http://127.0.0.1:"));
    assert!(url.ends_with("/routes"));

    let body = reqwest::get(url).await.unwrap().text().await.unwrap();
    assert_eq!(body, "1.0.0.0/8\n114.114.114.114/32\n");
}

#[tokio::test]
async fn test_public_host_advertised() {
    let dir = tempfile::tempdir().unwrap();
    let route_file = dir.path().join("routes.txt");
    std::fs::write(&route_file, "").unwrap();

    let config = ServerConfig {
        route_file: Some(route_file),
        http_addr: Some("127.0.0.1:0".parse().unwrap()),
        public_host: Some("relay.example.net".to_string()),
        ..test_config()
    };
    let addr = start_server(config).await;
    let (_stream, lease) = authorize(addr, "secret").await;

    let url = lease.route_url().unwrap();
    assert!(url.starts_with("http://relay.example.net:"));
    assert!(url.ends_with("/routes"));
}

struct NoopConfigurator;

#[async_trait]
impl NetworkConfigurator for NoopConfigurator {
    async fn configure_interface(&self, _: &str, _: &str, _: &str) -> Result<(), NetConfigError> {
        Ok(())
    }

    async fn release_interface(&self, _: &str, _: &str, _: &str) -> Result<(), NetConfigError> {
        Ok(())
    }

    async fn add_route(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), NetConfigError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_routed_traffic_goes_through_gateway_interface() {
    let (provider, mut handles) = ChannelProvider::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(test_config())
        .with_gateway_interface(Arc::new(provider), Arc::new(NoopConfigurator));
    tokio::spawn(server.serve(listener));

    let mut gateway = tokio::time::timeout(Duration::from_secs(5), handles.recv())
        .await
        .expect("gateway interface not created")
        .unwrap();

    let (mut client, lease) = authorize(addr, "secret").await;
    let client_ip: Ipv4Addr = lease.access_ip.parse().unwrap();

    // Destination from the route manifest, owned by no client
    let outbound = ipv4_packet(client_ip, Ipv4Addr::new(114, 114, 114, 114));
    send(&mut client, Frame::data(outbound.clone())).await;
    let written = tokio::time::timeout(Duration::from_secs(5), gateway.next_written())
        .await
        .expect("packet never reached the gateway interface")
        .unwrap();
    assert_eq!(&written[..], &outbound[..]);

    // The answer read from the gateway interface goes back to the client
    let inbound = ipv4_packet(Ipv4Addr::new(114, 114, 114, 114), client_ip);
    assert!(gateway.inject(inbound.clone()));
    let frame = recv(&mut client).await.unwrap();
    assert_eq!(frame.command, Command::TunnelData);
    assert_eq!(&frame.payload[..], &inbound[..]);

    println!("✓ Routed traffic crossed the gateway interface");
}
