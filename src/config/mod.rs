use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

// Re-export per-subsystem config types
pub use crate::loxone::SourceConfig;
pub use crate::mqtt::MqttConfig;
pub use crate::poller::PollerConfig;

/// Complete loxbridge configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoxbridgeConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub udp: UdpConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
}

/// Datagram side of the bridge
#[derive(Debug, Clone, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Address the receive socket binds to
    #[serde(default = "default_udp_ip")]
    pub ip: String,
    #[serde(default = "default_udp_port")]
    pub port: u16,
    /// Destination for forwarded broker messages (defaults to the bind address)
    #[serde(default)]
    pub target_ip: Option<String>,
    #[serde(default)]
    pub target_port: Option<u16>,
}

fn default_true() -> bool {
    true
}

fn default_udp_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_udp_port() -> u16 {
    5005
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip: default_udp_ip(),
            port: default_udp_port(),
            target_ip: None,
            target_port: None,
        }
    }
}

impl UdpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn target_addr(&self) -> String {
        format!(
            "{}:{}",
            self.target_ip.as_deref().unwrap_or(&self.ip),
            self.target_port.unwrap_or(self.port)
        )
    }
}

/// Selection viewer API
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_viewer_bind")]
    pub bind: String,
}

fn default_viewer_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_viewer_bind(),
        }
    }
}

/// Missing or invalid settings. Fatal for the affected subsystem only.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MissingSetting(&'static str),
    InvalidSetting { key: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingSetting(key) => write!(f, "missing required setting '{}'", key),
            ConfigError::InvalidSetting { key, reason } => {
                write!(f, "invalid setting '{}': {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl LoxbridgeConfig {
    /// Build from the TOML file at `path` (defaults if absent), then apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str::<LoxbridgeConfig>(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            LoxbridgeConfig::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment-style overrides. Unparsable numbers are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("MQTT_BROKER") {
            self.mqtt.host = v;
        }
        if let Some(n) = get("MQTT_PORT").and_then(|v| v.parse().ok()) {
            self.mqtt.port = n;
        }
        if let Some(v) = get("MQTT_TOPIC") {
            self.mqtt.topic = v;
        }
        if let Some(v) = get("UDP_IP") {
            self.udp.ip = v;
        }
        if let Some(n) = get("UDP_PORT").and_then(|v| v.parse().ok()) {
            self.udp.port = n;
        }
        if let Some(v) = get("LOXONE_URL") {
            self.source.url = Some(v);
        }
        if let Some(v) = get("LOXONE_USERNAME") {
            self.source.username = Some(v);
        }
        if let Some(v) = get("LOXONE_PASSWORD") {
            self.source.password = Some(v);
        }
        if let Some(v) = get("LOXONE_JSON_PATH") {
            self.source.json_path = Some(v.into());
        }
        if let Some(v) = get("LOXONE_STATE_URL_TEMPLATE") {
            self.source.state_url_template = Some(v);
        }
        if let Some(n) = get("AUTO_MODE_INTERVAL").and_then(|v| v.parse().ok()) {
            self.poller.interval_secs = n;
        }
        if let Some(v) = get("AUTO_MODE_TOPIC") {
            self.poller.base_topic = v;
        }
        if let Some(v) = get("AUTO_CONFIG_PATH") {
            self.poller.selection_path = v.into();
        }
    }

    /// Settings required by the broker <-> datagram bridge.
    pub fn validate_bridge(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::MissingSetting("mqtt.host"));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(ConfigError::MissingSetting("mqtt.topic"));
        }
        if self.mqtt.topic.contains(['+', '#']) {
            return Err(ConfigError::InvalidSetting {
                key: "mqtt.topic",
                reason: "bridge topic is published to and must not contain wildcards".to_string(),
            });
        }
        if self.mqtt.qos > 2 {
            return Err(ConfigError::InvalidSetting {
                key: "mqtt.qos",
                reason: format!("expected 0, 1 or 2, got {}", self.mqtt.qos),
            });
        }
        if self.udp.enabled {
            for (key, addr) in [
                ("udp.ip", self.udp.bind_addr()),
                ("udp.target_ip", self.udp.target_addr()),
            ] {
                if let Err(e) = addr.parse::<SocketAddr>() {
                    return Err(ConfigError::InvalidSetting {
                        key,
                        reason: format!("'{}' is not a socket address: {}", addr, e),
                    });
                }
            }
        }
        Ok(())
    }

    /// Settings required by the periodic publisher.
    pub fn validate_poller(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::MissingSetting("mqtt.host"));
        }
        if !self.source.is_configured() {
            return Err(ConfigError::MissingSetting("source.url or source.json_path"));
        }
        if self.poller.interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "poller.interval_secs",
                reason: "interval must be at least one second".to_string(),
            });
        }
        if self.poller.base_topic.trim().is_empty() {
            return Err(ConfigError::MissingSetting("poller.base_topic"));
        }
        Ok(())
    }
}
