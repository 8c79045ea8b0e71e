// MQTT broker integration

mod client;
mod publisher;
mod topic;

pub use client::{connect, run_event_loop, MqttConfig};
pub use publisher::{MqttPublisher, Publisher};
pub use topic::resolve_target_topic;
