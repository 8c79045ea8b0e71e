// Integration tests for echo suppression across the bridge and the poller
//
// A loopback publisher stands in for the broker: everything published on the
// bridge topic is delivered back to the inbound path, the way a broker echoes
// a client's own publishes to its subscription.

use anyhow::Result;
use async_trait::async_trait;
use loxbridge::bridge::Bridge;
use loxbridge::guard::LoopGuard;
use loxbridge::loxone::SourceConfig;
use loxbridge::mqtt::Publisher;
use loxbridge::poller::{Poller, PollerConfig, PollerState};
use loxbridge::selection::SelectionStore;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

// ── Loopback broker ──────────────────────────────────────────────────────────

struct LoopbackBroker {
    subscription: String,
    delivered: mpsc::Sender<Vec<u8>>,
    published: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Publisher for LoopbackBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        if topic == self.subscription {
            self.delivered.send(payload.as_bytes().to_vec()).await?;
        }
        Ok(())
    }
}

struct Harness {
    guard: Arc<LoopGuard>,
    broker: Arc<LoopbackBroker>,
    bridge: Arc<Bridge>,
    target: UdpSocket,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

async fn harness(subscription: &str) -> Harness {
    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (tx, rx) = mpsc::channel(32);
    let guard = Arc::new(LoopGuard::new());
    let broker = Arc::new(LoopbackBroker {
        subscription: subscription.to_string(),
        delivered: tx,
        published: Mutex::new(Vec::new()),
    });
    let publisher: Arc<dyn Publisher> = broker.clone();
    let bridge = Arc::new(Bridge::new(
        subscription,
        target.local_addr().unwrap(),
        Arc::clone(&guard),
        publisher,
    ));
    Harness {
        guard,
        broker,
        bridge,
        target,
        inbound_rx: Some(rx),
    }
}

async fn recv_text(socket: &UdpSocket) -> Option<String> {
    let mut buf = [0u8; 1024];
    match timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(String::from_utf8_lossy(&buf[..len]).into_owned()),
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_datagram_round_trip_does_not_loop() {
    let mut h = harness("home/bridge").await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let inbound = tokio::spawn(
        Arc::clone(&h.bridge).run_inbound(h.inbound_rx.take().unwrap(), shutdown_rx.clone()),
    );

    let listen = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listen.local_addr().unwrap();
    let outbound = tokio::spawn(Arc::clone(&h.bridge).run_outbound(listen, shutdown_rx));

    let sensor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sensor.send_to(b"temp=21.5", listen_addr).await.unwrap();

    // Published once, echo consumed, nothing sent back to the datagram side
    for _ in 0..50 {
        if h.guard.is_empty() && !h.broker.published.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        *h.broker.published.lock().unwrap(),
        vec![("home/bridge".to_string(), "temp=21.5".to_string())]
    );
    assert!(h.guard.is_empty());
    assert_eq!(recv_text(&h.target).await, None);

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(1), inbound).await.unwrap().unwrap();
    timeout(Duration::from_secs(1), outbound).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_foreign_message_reaches_datagram_side() {
    let mut h = harness("home/bridge").await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let tx = h.broker.delivered.clone();
    tokio::spawn(Arc::clone(&h.bridge).run_inbound(h.inbound_rx.take().unwrap(), shutdown_rx));

    // Another client publishes on the bridge topic
    tx.send(b"set light=on".to_vec()).await.unwrap();

    assert_eq!(recv_text(&h.target).await.as_deref(), Some("set light=on"));
}

#[tokio::test]
async fn test_observed_poller_publish_is_not_forwarded() {
    let mut h = harness("awtrix/device/custom/uuid-1").await;
    let dir = tempfile::tempdir().unwrap();

    let snapshot = json!({
        "controls": {
            "uuid-1": {"name": "Aussen", "details": {"unit": "°C"}}
        }
    });
    let json_path = dir.path().join("lox.json");
    std::fs::write(&json_path, snapshot.to_string()).unwrap();

    let store = Arc::new(SelectionStore::open(dir.path().join("auto_config.json")));
    store.set_enabled("uuid-1", true).unwrap();

    let publisher: Arc<dyn Publisher> = h.broker.clone();
    let poller = Poller::new(
        &PollerConfig::default(),
        SourceConfig {
            json_path: Some(json_path),
            ..SourceConfig::default()
        },
        store,
        Arc::clone(&h.guard),
        publisher,
    )
    .with_echo_topic("awtrix/device/custom/uuid-1");

    let report = poller.run_cycle(&mut PollerState::default()).await.unwrap();
    assert_eq!(report.published, 1);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let inbound = tokio::spawn(
        Arc::clone(&h.bridge).run_inbound(h.inbound_rx.take().unwrap(), shutdown_rx),
    );

    assert_eq!(recv_text(&h.target).await, None);
    assert!(h.guard.is_empty());
    assert_eq!(
        h.broker.published.lock().unwrap()[0],
        (
            "awtrix/device/custom/uuid-1".to_string(),
            r#"{"text":"Aussen: unit: °C"}"#.to_string()
        )
    );
    inbound.abort();
}
