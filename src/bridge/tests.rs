use super::*;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(String, String)>>,
    fail: bool,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if self.fail {
            anyhow::bail!("broker unavailable");
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}

async fn udp_target() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn recv_text(socket: &UdpSocket) -> Option<String> {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    match timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(String::from_utf8_lossy(&buf[..len]).into_owned()),
        _ => None,
    }
}

fn bridge_with(
    target: SocketAddr,
    publisher: Arc<RecordingPublisher>,
) -> (Bridge, Arc<LoopGuard>) {
    let guard = Arc::new(LoopGuard::new());
    let bridge = Bridge::new("test/topic", target, Arc::clone(&guard), publisher);
    (bridge, guard)
}

#[tokio::test]
async fn test_broker_message_forwarded_to_udp() {
    let (target, addr) = udp_target().await;
    let (bridge, _) = bridge_with(addr, Arc::new(RecordingPublisher::default()));

    let outcome = bridge.handle_broker_message(b"payload").await.unwrap();

    assert_eq!(outcome, InboundOutcome::Forwarded);
    assert_eq!(recv_text(&target).await.as_deref(), Some("payload"));
}

#[tokio::test]
async fn test_identical_payload_forwarded_only_once() {
    let (target, addr) = udp_target().await;
    let (bridge, _) = bridge_with(addr, Arc::new(RecordingPublisher::default()));

    assert_eq!(
        bridge.handle_broker_message(b"hello").await.unwrap(),
        InboundOutcome::Forwarded
    );
    assert_eq!(
        bridge.handle_broker_message(b"hello").await.unwrap(),
        InboundOutcome::Duplicate
    );

    assert_eq!(recv_text(&target).await.as_deref(), Some("hello"));
    assert_eq!(recv_text(&target).await, None);
    assert_eq!(bridge.forwarded_count(), 1);
}

#[tokio::test]
async fn test_locally_published_message_is_ignored() {
    let (target, addr) = udp_target().await;
    let (bridge, guard) = bridge_with(addr, Arc::new(RecordingPublisher::default()));
    guard.record_local("payload");

    let outcome = bridge.handle_broker_message(b"payload").await.unwrap();

    assert_eq!(outcome, InboundOutcome::Suppressed);
    assert_eq!(recv_text(&target).await, None);
    assert!(guard.is_empty());
}

#[tokio::test]
async fn test_datagram_published_and_echo_suppressed() {
    let (target, addr) = udp_target().await;
    let publisher = Arc::new(RecordingPublisher::default());
    let (bridge, guard) = bridge_with(addr, Arc::clone(&publisher));

    bridge.handle_datagram(b"from-udp").await.unwrap();

    assert_eq!(
        *publisher.published.lock().unwrap(),
        vec![("test/topic".to_string(), "from-udp".to_string())]
    );
    assert_eq!(guard.pending("from-udp"), 1);

    // Broker delivers our own publish back
    assert_eq!(
        bridge.handle_broker_message(b"from-udp").await.unwrap(),
        InboundOutcome::Suppressed
    );
    assert_eq!(recv_text(&target).await, None);
}

#[tokio::test]
async fn test_failed_publish_releases_registration() {
    let (_target, addr) = udp_target().await;
    let publisher = Arc::new(RecordingPublisher {
        fail: true,
        ..Default::default()
    });
    let (bridge, guard) = bridge_with(addr, publisher);

    assert!(bridge.handle_datagram(b"lost").await.is_err());
    assert_eq!(guard.pending("lost"), 0);
}

#[tokio::test]
async fn test_invalid_utf8_forwarded_best_effort() {
    let (target, addr) = udp_target().await;
    let (bridge, _) = bridge_with(addr, Arc::new(RecordingPublisher::default()));

    let outcome = bridge.handle_broker_message(&[b'o', b'k', 0xff]).await.unwrap();

    assert_eq!(outcome, InboundOutcome::Forwarded);
    assert_eq!(recv_text(&target).await.as_deref(), Some("ok\u{fffd}"));
}

#[tokio::test]
async fn test_run_outbound_until_shutdown() {
    let (_target, addr) = udp_target().await;
    let publisher = Arc::new(RecordingPublisher::default());
    let (bridge, _) = bridge_with(addr, Arc::clone(&publisher));
    let bridge = Arc::new(bridge);

    let listen = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listen.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&bridge).run_outbound(listen, shutdown_rx));

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"sensor=1", listen_addr).await.unwrap();

    for _ in 0..50 {
        if !publisher.published.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        publisher.published.lock().unwrap().first().map(|(_, p)| p.clone()),
        Some("sensor=1".to_string())
    );

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_inbound_stops_when_channel_closes() {
    let (target, addr) = udp_target().await;
    let (bridge, _) = bridge_with(addr, Arc::new(RecordingPublisher::default()));
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(Arc::new(bridge).run_inbound(rx, shutdown_rx));
    tx.send(b"queued".to_vec()).await.unwrap();
    drop(tx);

    timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    assert_eq!(recv_text(&target).await.as_deref(), Some("queued"));
}

fn udp_config(ip: &str, port: u16) -> UdpConfig {
    UdpConfig {
        ip: ip.to_string(),
        port,
        ..UdpConfig::default()
    }
}

#[tokio::test]
async fn test_bind_endpoint() {
    let endpoint = bind_endpoint(&UdpConfig {
        target_port: Some(7000),
        ..udp_config("127.0.0.1", 0)
    })
    .await
    .unwrap();

    assert!(endpoint.socket.local_addr().unwrap().port() > 0);
    assert_eq!(endpoint.target, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
}

#[tokio::test]
async fn test_bind_endpoint_address_in_use() {
    let (_taken, addr) = udp_target().await;

    let err = bind_endpoint(&udp_config("127.0.0.1", addr.port()))
        .await
        .err()
        .unwrap();

    assert!(err.to_string().contains("Failed to bind UDP socket"));
}

#[tokio::test]
async fn test_bind_endpoint_invalid_target() {
    let err = bind_endpoint(&UdpConfig {
        target_ip: Some("not-an-ip".to_string()),
        ..udp_config("127.0.0.1", 0)
    })
    .await
    .err()
    .unwrap();

    assert!(err.to_string().contains("Invalid UDP target address"));
}
