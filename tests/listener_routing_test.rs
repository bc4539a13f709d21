use parking_lot::Mutex;
use rask_syslog_relay::app::Relay;
use rask_syslog_relay::buffer::BatchConfig;
use rask_syslog_relay::dispatch::DispatchConfig;
use rask_syslog_relay::domain::{
    DestinationConfig, DestinationKind, Protocol, SourceConfig, SourceMetrics, StorageConfig,
};
use rask_syslog_relay::listener::{
    ListenerMultiplexer, MAX_MESSAGE_SIZE, MessageHandler, RouteOutcome,
};
use rask_syslog_relay::source::PipelineSettings;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Default)]
struct Collect {
    messages: Mutex<Vec<(String, String)>>,
}

impl Collect {
    fn texts(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    fn len(&self) -> usize {
        self.messages.lock().len()
    }
}

impl MessageHandler for Collect {
    fn handle_message(&self, data: &[u8], peer_ip: &str) {
        self.messages
            .lock()
            .push((String::from_utf8_lossy(data).into_owned(), peer_ip.to_string()));
    }
}

async fn wait_for(handler: &Collect, count: usize) {
    for _ in 0..200 {
        if handler.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} messages, got {}", handler.len());
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn test_udp_exact_route_wins_over_wildcard() {
    let listener = ListenerMultiplexer::start_on(Protocol::Udp, loopback()).unwrap();
    let exact = Arc::new(Collect::default());
    let wildcard = Arc::new(Collect::default());
    listener.add_source("127.0.0.1", exact.clone()).unwrap();
    listener.add_source("0.0.0.0", wildcard.clone()).unwrap();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"<134>first\n", listener.local_addr())
        .await
        .unwrap();
    wait_for(&exact, 1).await;

    assert_eq!(exact.texts(), vec!["<134>first"]);
    assert_eq!(exact.messages.lock()[0].1, "127.0.0.1");
    assert_eq!(wildcard.len(), 0);

    // With the exact route gone, the wildcard picks the peer up.
    assert!(listener.remove_source("127.0.0.1"));
    client
        .send_to(b"<134>second", listener.local_addr())
        .await
        .unwrap();
    wait_for(&wildcard, 1).await;
    assert_eq!(wildcard.texts(), vec!["<134>second"]);
    assert_eq!(listener.received_count(), 2);

    listener.stop();
}

#[tokio::test]
async fn test_udp_unknown_peer_is_dropped() {
    let listener = ListenerMultiplexer::start_on(Protocol::Udp, loopback()).unwrap();
    let other = Arc::new(Collect::default());
    listener.add_source("10.1.2.3", other.clone()).unwrap();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"lost", listener.local_addr()).await.unwrap();

    for _ in 0..200 {
        if listener.unrouted_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(listener.unrouted_count(), 1);
    assert_eq!(other.len(), 0);
    listener.stop();
}

#[tokio::test]
async fn test_tcp_lines_are_messages() {
    let listener = ListenerMultiplexer::start_on(Protocol::Tcp, loopback()).unwrap();
    let handler = Arc::new(Collect::default());
    listener.add_source("0.0.0.0", handler.clone()).unwrap();

    let mut stream = tokio::net::TcpStream::connect(listener.local_addr())
        .await
        .unwrap();
    stream
        .write_all(b"one\r\ntwo\n\nthree\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();

    wait_for(&handler, 3).await;
    assert_eq!(handler.texts(), vec!["one", "two", "three"]);
    listener.stop();
}

#[tokio::test]
async fn test_direct_dispatch_uses_canonical_peer() {
    let listener = ListenerMultiplexer::start_on(Protocol::Udp, loopback()).unwrap();
    let handler = Arc::new(Collect::default());
    listener.add_source("192.168.1.10", handler.clone()).unwrap();

    let mapped: IpAddr = "::ffff:192.168.1.10".parse().unwrap();
    assert_eq!(listener.dispatch(b"hello", mapped), RouteOutcome::Exact);
    assert_eq!(handler.messages.lock()[0].1, "192.168.1.10");

    let stranger: IpAddr = "192.168.1.11".parse().unwrap();
    assert_eq!(listener.route(stranger), RouteOutcome::Dropped);
    listener.stop();
}

#[tokio::test]
async fn test_duplicate_route_is_rejected() {
    let listener = ListenerMultiplexer::start_on(Protocol::Udp, loopback()).unwrap();
    listener
        .add_source("10.0.0.1", Arc::new(Collect::default()))
        .unwrap();
    let err = listener
        .add_source("10.0.0.1", Arc::new(Collect::default()))
        .unwrap_err();
    assert!(err.to_string().contains("10.0.0.1"));

    listener.stop();
    assert!(
        listener
            .add_source("10.0.0.2", Arc::new(Collect::default()))
            .is_err()
    );
}

#[tokio::test]
async fn test_exact_and_wildcard_sources_on_one_port() {
    let listener = ListenerMultiplexer::start_on(Protocol::Udp, loopback()).unwrap();
    let source_a = Arc::new(Collect::default());
    let source_b = Arc::new(Collect::default());
    listener.add_source("10.0.0.1", source_a.clone()).unwrap();
    listener.add_source("0.0.0.0", source_b.clone()).unwrap();

    let from_a: IpAddr = "10.0.0.1".parse().unwrap();
    let from_other: IpAddr = "10.0.0.9".parse().unwrap();
    for _ in 0..3 {
        assert_eq!(listener.dispatch(b"a", from_a), RouteOutcome::Exact);
        assert_eq!(listener.dispatch(b"b", from_other), RouteOutcome::Wildcard);
    }

    assert_eq!(source_a.texts(), vec!["a"; 3]);
    assert_eq!(source_b.texts(), vec!["b"; 3]);
    assert_eq!(listener.unrouted_count(), 0);
    listener.stop();
}

fn storage_source(name: &str, ip: &str, port: u16, dir: &Path) -> SourceConfig {
    let mut config = SourceConfig::new(name, ip, port, Protocol::Tcp);
    config.destinations.push(DestinationConfig {
        id: "disk".to_string(),
        name: String::new(),
        kind: DestinationKind::Storage(StorageConfig::new(dir)),
        enabled: true,
    });
    config
}

fn stored_events(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = entries.map(|e| e.unwrap().path()).collect();
    paths.sort();
    paths
        .iter()
        .flat_map(|path| {
            std::fs::read_to_string(path)
                .unwrap()
                .lines()
                .map(|line| {
                    let record: serde_json::Value = serde_json::from_str(line).unwrap();
                    record["event"].as_str().unwrap().to_string()
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

async fn metrics_when(
    relay: &Relay,
    name: &str,
    done: impl Fn(&SourceMetrics) -> bool,
) -> SourceMetrics {
    for _ in 0..250 {
        let metrics = relay.source_metrics_for(name).await.unwrap();
        if done(&metrics) {
            return metrics;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("metrics for {name} never settled");
}

#[tokio::test]
async fn test_tcp_relay_routes_exact_peer_before_wildcard() {
    let exact_dir = tempfile::tempdir().unwrap();
    let wildcard_dir = tempfile::tempdir().unwrap();
    let port = std::net::TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let relay = Relay::new(PipelineSettings {
        batch: BatchConfig {
            max_size: 100,
            max_wait_time: Duration::from_millis(50),
        },
        dispatch: DispatchConfig {
            flush_interval: Duration::from_millis(50),
            ..DispatchConfig::default()
        },
        tick_interval: Duration::from_millis(50),
        ..PipelineSettings::default()
    });
    relay
        .add_source(storage_source("loopback", "127.0.0.1", port, exact_dir.path()))
        .await
        .unwrap();
    relay
        .add_source(storage_source("everyone", "0.0.0.0", port, wildcard_dir.path()))
        .await
        .unwrap();
    assert_eq!(relay.listeners().len(), 1);

    let oversized = "x".repeat(MAX_MESSAGE_SIZE + 1);
    let mut exact = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    exact
        .write_all(format!("first\r\n{oversized}\nsecond\n").as_bytes())
        .await
        .unwrap();
    exact.flush().await.unwrap();

    // Any 127.0.0.0/8 address reaches loopback, so this peer has no exact route.
    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.2:0".parse().unwrap()).unwrap();
    let mut other = socket
        .connect(SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .unwrap();
    other.write_all(b"elsewhere\n").await.unwrap();
    other.flush().await.unwrap();

    let loopback = metrics_when(&relay, "loopback", |m| m.sent_count == 2).await;
    let everyone = metrics_when(&relay, "everyone", |m| m.sent_count == 1).await;
    assert_eq!(loopback.total_logs_ingested, 2);
    assert_eq!(everyone.total_logs_ingested, 1);

    assert_eq!(stored_events(exact_dir.path()), vec!["first", "second"]);
    assert_eq!(stored_events(wildcard_dir.path()), vec!["elsewhere"]);

    relay.shutdown().await;
    assert!(relay.listeners().is_empty());
}
