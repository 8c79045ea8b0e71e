use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use tracing::debug;

/// Outbound side of the broker connection.
///
/// Shared by both bridge paths and the poller.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
}

/// Publisher backed by the shared rumqttc client
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, qos: QoS) -> Self {
        Self { client, qos }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        debug!(topic = %topic, payload_len = payload.len(), "Publishing MQTT message");
        self.client
            .publish(topic, self.qos, false, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("Failed to publish to topic '{}'", topic))
    }
}
