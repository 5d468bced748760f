//! Listener admission and connection lifetime over loopback.
//!
//! Loopback covers all of 127.0.0.0/8, so clients bound to different
//! 127.0.0.x addresses exercise the per-IP and per-subnet limits
//! independently.

use {
    std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        sync::Arc,
        time::Duration,
    },
    tokio::{
        io::AsyncReadExt,
        net::{TcpSocket, TcpStream},
        sync::mpsc,
    },
    trv1_node_net::{Connection, ConnectionConfig, DropPolicy, Listener, NetConfig, NetError},
};

fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

async fn connect_from(local: Ipv4Addr, server: SocketAddr) -> TcpStream {
    let socket = TcpSocket::new_v4().unwrap();
    socket
        .bind(SocketAddr::new(IpAddr::V4(local), 0))
        .unwrap();
    socket.connect(server).await.unwrap()
}

/// `true` if the listener closed the stream instead of admitting it.
async fn was_rejected(stream: &mut TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match tokio::time::timeout(Duration::from_millis(300), stream.read(&mut byte)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

async fn start_listener(
    config: NetConfig,
) -> (Listener, SocketAddr, mpsc::UnboundedReceiver<Arc<Connection>>) {
    let listener = Listener::new(config);
    let addr = listener.start().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    listener
        .on_connection(move |connection| tx.send(connection).is_ok())
        .unwrap();
    (listener, addr, rx)
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission limits
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_per_ip_limit_is_independent_of_subnet_limit() {
    init_logging();
    let mut config = NetConfig::dev_default();
    config.max_connections_per_ip = 1;
    config.max_connections_per_subnet = 3;
    let (listener, addr, mut admitted) = start_listener(config).await;

    let _a = connect_from(Ipv4Addr::new(127, 0, 0, 1), addr).await;
    let first = admitted.recv().await.unwrap();
    let _b = connect_from(Ipv4Addr::new(127, 0, 0, 2), addr).await;
    let _second = admitted.recv().await.unwrap();

    let mut repeat = connect_from(Ipv4Addr::new(127, 0, 0, 1), addr).await;
    assert!(was_rejected(&mut repeat).await);
    assert!(admitted.try_recv().is_err());
    assert!(!first.is_closed());

    let stats = listener.stats();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.rejected_per_ip, 1);
    assert_eq!(stats.rejected_per_subnet, 0);
}

#[tokio::test]
async fn test_per_subnet_limit() {
    init_logging();
    let mut config = NetConfig::dev_default();
    config.max_connections_per_ip = 0;
    config.max_connections_per_subnet = 2;
    let (listener, addr, mut admitted) = start_listener(config).await;

    let _a = connect_from(Ipv4Addr::new(127, 0, 0, 1), addr).await;
    let _first = admitted.recv().await.unwrap();
    let _b = connect_from(Ipv4Addr::new(127, 0, 0, 2), addr).await;
    let _second = admitted.recv().await.unwrap();

    // Same /24 as the two admitted peers.
    let mut third = connect_from(Ipv4Addr::new(127, 0, 0, 3), addr).await;
    assert!(was_rejected(&mut third).await);
    assert_eq!(listener.stats().rejected_per_subnet, 1);

    // A different /24 is counted separately.
    let mut other = connect_from(Ipv4Addr::new(127, 0, 1, 1), addr).await;
    assert!(!was_rejected(&mut other).await);
    assert!(admitted.recv().await.is_some());
    assert_eq!(listener.stats().accepted, 3);
}

#[tokio::test]
async fn test_live_counts_never_exceed_limits() {
    init_logging();
    let mut config = NetConfig::dev_default();
    config.max_connections_per_ip = 2;
    config.max_connections_per_subnet = 0;
    let (listener, addr, mut admitted) = start_listener(config).await;

    let mut clients = Vec::new();
    for _ in 0..6 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut held = Vec::new();
    while let Ok(connection) = admitted.try_recv() {
        held.push(connection);
    }
    assert_eq!(held.len(), 2);
    assert_eq!(listener.stats().rejected_per_ip, 4);
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection lifetime
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_connections_time_out_on_both_sides() {
    init_logging();
    let mut config = NetConfig::dev_default();
    config.connection.io_timeout_ms = 100;
    config.connection.silent_connection_tolerance_ms = 100;
    let (_listener, addr, mut admitted) = start_listener(config.clone()).await;

    let client = Connection::new(&config.connection);
    client.connect(addr).await.unwrap();
    let server = admitted.recv().await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(client.has_timed_out());
    assert!(client.is_closed());
    assert!(server.is_closed());
}

#[tokio::test]
async fn test_frames_flow_between_admitted_connections() {
    init_logging();
    let config = NetConfig::dev_default();
    let (_listener, addr, mut admitted) = start_listener(config.clone()).await;

    let client = Connection::new(&ConnectionConfig::default());
    client.connect(addr).await.unwrap();
    let server = admitted.recv().await.unwrap();

    for chunk in [&b"one"[..], b"two", b"six"] {
        assert!(client.write(bytes::Bytes::copy_from_slice(chunk), DropPolicy::Limiter, None));
    }
    let mut buffer = Vec::new();
    server.read(&mut buffer, 9).await.unwrap();
    assert_eq!(&buffer, b"onetwosix");

    client.close();
    let result = server.read(&mut buffer, 1).await;
    assert!(matches!(result, Err(NetError::Io(_))));
    assert!(server.is_closed());
}
