use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT configuration
#[derive(Clone, Debug, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Topic the bridge subscribes to and republishes datagrams on
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub qos: u8,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_topic() -> String {
    "test/topic".to_string()
}

fn default_client_id_prefix() -> String {
    "loxbridge".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            topic: default_topic(),
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive_secs(),
            qos: 0,
        }
    }
}

impl MqttConfig {
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

/// Create the long-lived client. Nothing happens on the wire until the event
/// loop is polled.
pub fn connect(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    let client_id = format!("{}-{}", config.client_id_prefix, uuid::Uuid::new_v4());
    info!(
        host = %config.host,
        port = config.port,
        client_id = %client_id,
        "Connecting to MQTT broker"
    );

    let mut options = MqttOptions::new(client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    AsyncClient::new(options, 100)
}

/// Drive the broker connection until shutdown.
///
/// With an inbound channel, subscribes to `topic` on every (re)connect and
/// forwards payloads published on it. Without one the loop only carries
/// outgoing publishes. Connection errors are retried with exponential backoff.
pub async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    topic: String,
    qos: QoS,
    inbound_tx: Option<mpsc::Sender<Vec<u8>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnect_delay = Duration::from_secs(1);
    let max_reconnect_delay = Duration::from_secs(30);
    let mut consecutive_errors: u32 = 0;

    loop {
        let event = tokio::select! {
            event = event_loop.poll() => event,
            _ = shutdown.changed() => {
                info!("MQTT event loop shutting down");
                let _ = client.try_disconnect();
                return;
            }
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if consecutive_errors > 0 {
                    info!("MQTT connection restored");
                }
                reconnect_delay = Duration::from_secs(1);
                consecutive_errors = 0;

                if inbound_tx.is_none() {
                    info!("Connected to MQTT broker");
                    continue;
                }
                info!(topic = %topic, "Connected to MQTT broker, subscribing");
                if let Err(e) = client.try_subscribe(topic.as_str(), qos) {
                    error!(error = %e, topic = %topic, "Failed to queue subscription");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(inbound_tx) = &inbound_tx else {
                    continue;
                };
                if publish.topic != topic {
                    debug!(topic = %publish.topic, "Ignoring message on foreign topic");
                    continue;
                }
                debug!(
                    topic = %publish.topic,
                    payload_len = publish.payload.len(),
                    "Received MQTT message"
                );
                if inbound_tx.send(publish.payload.to_vec()).await.is_err() {
                    warn!("Inbound path closed, stopping MQTT event loop");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                consecutive_errors += 1;
                error!(
                    error = %e,
                    consecutive_errors = consecutive_errors,
                    retry_in_secs = reconnect_delay.as_secs(),
                    "MQTT connection error, will retry with exponential backoff"
                );

                tokio::select! {
                    _ = tokio::time::sleep(reconnect_delay) => {}
                    _ = shutdown.changed() => return,
                }
                reconnect_delay = std::cmp::min(reconnect_delay * 2, max_reconnect_delay);
            }
        }
    }
}
