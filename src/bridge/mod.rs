//! Always-on forwarding between the broker topic and the datagram transport.
//!
//! Inbound: broker message -> echo check -> datagram to the UDP target.
//! Outbound: datagram -> register echo -> publish on the broker topic.

use crate::config::UdpConfig;
use crate::guard::LoopGuard;
use crate::mqtt::Publisher;
use anyhow::{Context, Result};
use dashmap::DashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

/// Datagrams longer than this are truncated
pub const RECV_BUFFER_SIZE: usize = 1024;

/// What happened to a message received from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Our own echo, dropped
    Suppressed,
    /// Identical text was already forwarded earlier, dropped
    Duplicate,
    Forwarded,
}

pub struct Bridge {
    topic: String,
    udp_target: SocketAddr,
    guard: Arc<LoopGuard>,
    publisher: Arc<dyn Publisher>,
    /// Payload texts already sent to the datagram side.
    // TODO: cap this memo (e.g. LRU) once it is settled whether repeated
    // identical payloads must ever be re-sent; it currently grows for the
    // lifetime of the process.
    forwarded: DashSet<String>,
}

impl Bridge {
    pub fn new(
        topic: impl Into<String>,
        udp_target: SocketAddr,
        guard: Arc<LoopGuard>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            topic: topic.into(),
            udp_target,
            guard,
            publisher,
            forwarded: DashSet::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of distinct payloads forwarded so far
    pub fn forwarded_count(&self) -> usize {
        self.forwarded.len()
    }

    /// Inbound path for one broker message.
    pub async fn handle_broker_message(&self, payload: &[u8]) -> Result<InboundOutcome> {
        let text = String::from_utf8_lossy(payload).into_owned();

        if self.guard.should_ignore(&text) {
            debug!(payload_len = text.len(), "Dropping echo of local publish");
            return Ok(InboundOutcome::Suppressed);
        }

        if !self.forwarded.insert(text.clone()) {
            debug!(payload_len = text.len(), "Payload already forwarded, skipping");
            return Ok(InboundOutcome::Duplicate);
        }

        if let Err(e) = send_datagram(self.udp_target, text.as_bytes()).await {
            // Allow a later retry of the same text
            self.forwarded.remove(&text);
            return Err(e);
        }

        debug!(target = %self.udp_target, payload_len = text.len(), "Forwarded MQTT message to UDP");
        Ok(InboundOutcome::Forwarded)
    }

    /// Outbound path for one datagram.
    pub async fn handle_datagram(&self, data: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(data).into_owned();

        // Register before publishing, the echo may arrive before publish returns
        self.guard.record_local(&text);

        if let Err(e) = self.publisher.publish(&self.topic, &text).await {
            // No echo will arrive for a failed publish
            self.guard.should_ignore(&text);
            return Err(e);
        }

        debug!(topic = %self.topic, payload_len = text.len(), "Forwarded UDP message to MQTT");
        Ok(())
    }

    /// Consume broker messages until the channel closes or shutdown is signalled.
    pub async fn run_inbound(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(topic = %self.topic, target = %self.udp_target, "Starting MQTT -> UDP path");
        loop {
            let payload = tokio::select! {
                payload = inbound_rx.recv() => match payload {
                    Some(p) => p,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            if let Err(e) = self.handle_broker_message(&payload).await {
                error!(error = %e, "Failed to forward MQTT message to UDP");
            }
        }
        info!("MQTT -> UDP path stopped");
    }

    /// Receive datagrams on `socket` until shutdown is signalled.
    pub async fn run_outbound(self: Arc<Self>, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
        match socket.local_addr() {
            Ok(addr) => info!(bind = %addr, topic = %self.topic, "Starting UDP -> MQTT path"),
            Err(_) => info!(topic = %self.topic, "Starting UDP -> MQTT path"),
        }

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let received = tokio::select! {
                received = socket.recv_from(&mut buf) => received,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok((len, from)) => {
                    debug!(from = %from, len = len, "Received UDP datagram");
                    if let Err(e) = self.handle_datagram(&buf[..len]).await {
                        error!(error = %e, "Failed to forward UDP message to MQTT");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                }
            }
        }
        info!("UDP -> MQTT path stopped");
    }
}

/// Bound receive socket plus the destination for forwarded broker messages
pub struct DatagramEndpoint {
    pub socket: UdpSocket,
    pub target: SocketAddr,
}

/// Resolve the target and bind the receive socket.
///
/// Errors here disable the bridge only; callers keep the other subsystems running.
pub async fn bind_endpoint(config: &UdpConfig) -> Result<DatagramEndpoint> {
    let target_addr = config.target_addr();
    let target: SocketAddr = target_addr
        .parse()
        .with_context(|| format!("Invalid UDP target address {}", target_addr))?;

    let bind_addr = config.bind_addr();
    let socket = UdpSocket::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind UDP socket {}", bind_addr))?;

    Ok(DatagramEndpoint { socket, target })
}

/// Send one datagram from a fresh ephemeral socket.
async fn send_datagram(target: SocketAddr, payload: &[u8]) -> Result<()> {
    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(local)
        .await
        .context("Failed to bind UDP send socket")?;
    socket
        .send_to(payload, target)
        .await
        .with_context(|| format!("Failed to send datagram to {}", target))?;
    Ok(())
}
