//! Periodic publisher for controls enabled in the selection store.
//!
//! Each cycle clears controls that were disabled since the previous cycle,
//! then (if anything is enabled) fetches a fresh snapshot and publishes one
//! message per enabled control. Fetch failures only skip the cycle.

use crate::guard::LoopGuard;
use crate::loxone::{extract_controls, SourceConfig, StateFetcher};
use crate::message::{format_message, CLEAR_PAYLOAD};
use crate::mqtt::{resolve_target_topic, Publisher};
use crate::selection::SelectionStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};


/// Poller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Topic base, see [`resolve_target_topic`]
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_selection_path")]
    pub selection_path: PathBuf,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_base_topic() -> String {
    "awtrix/device/custom".to_string()
}

fn default_selection_path() -> PathBuf {
    PathBuf::from("auto_config.json")
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            base_topic: default_base_topic(),
            selection_path: default_selection_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerPhase {
    /// Nothing enabled, no fetch performed
    Idle,
    Publishing,
}

/// State carried from one cycle to the next
#[derive(Debug, Clone)]
pub struct PollerState {
    pub phase: PollerPhase,
    /// Ids enabled during the previous cycle
    pub previous_enabled: HashSet<String>,
}

impl Default for PollerState {
    fn default() -> Self {
        Self {
            phase: PollerPhase::Idle,
            previous_enabled: HashSet::new(),
        }
    }
}

/// Result of one successful cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cleared: usize,
    pub published: usize,
    pub pruned: usize,
}

/// Counters exposed to the viewer
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerStatus {
    pub last_cycle: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cycle_count: u64,
    pub failure_count: u64,
    pub published_count: u64,
}

pub type SharedPollerStatus = Arc<Mutex<PollerStatus>>;

pub struct Poller {
    base_topic: String,
    interval: Duration,
    source: SourceConfig,
    store: Arc<SelectionStore>,
    guard: Arc<LoopGuard>,
    publisher: Arc<dyn Publisher>,
    /// Topic the bridge subscribes to; publishes on it are registered as echoes
    echo_topic: Option<String>,
    status: SharedPollerStatus,
}

impl Poller {
    pub fn new(
        config: &PollerConfig,
        source: SourceConfig,
        store: Arc<SelectionStore>,
        guard: Arc<LoopGuard>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            base_topic: config.base_topic.clone(),
            interval: Duration::from_secs(config.interval_secs),
            source,
            store,
            guard,
            publisher,
            echo_topic: None,
            status: Arc::new(Mutex::new(PollerStatus::default())),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_echo_topic(mut self, topic: impl Into<String>) -> Self {
        self.echo_topic = Some(topic.into());
        self
    }

    pub fn status(&self) -> SharedPollerStatus {
        Arc::clone(&self.status)
    }

    /// Run cycles until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            base_topic = %self.base_topic,
            interval_secs = self.interval.as_secs_f64(),
            "Starting poller"
        );

        let mut state = PollerState::default();
        loop {
            match self.run_cycle(&mut state).await {
                Ok(report) => {
                    if report.published > 0 || report.cleared > 0 {
                        debug!(
                            published = report.published,
                            cleared = report.cleared,
                            pruned = report.pruned,
                            "Poll cycle complete"
                        );
                    }
                    let mut status = self.status.lock().unwrap();
                    status.last_cycle = Some(Utc::now());
                    status.last_error = None;
                    status.cycle_count += 1;
                    status.published_count += report.published as u64;
                }
                Err(e) => {
                    let mut status = self.status.lock().unwrap();
                    status.failure_count += 1;
                    status.last_error = Some(e.to_string());
                    error!(
                        error = %e,
                        failures = status.failure_count,
                        "Poll cycle failed, retrying next interval"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Poller stopped");
    }

    /// One poll cycle. Errors mean the snapshot could not be fetched.
    pub async fn run_cycle(&self, state: &mut PollerState) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let enabled = self.store.enabled_ids();

        let mut disabled: Vec<&String> = state.previous_enabled.difference(&enabled).collect();
        disabled.sort();
        for uuid in disabled {
            let topic = resolve_target_topic(&self.base_topic, uuid);
            if self.publish(&topic, CLEAR_PAYLOAD).await {
                info!(uuid = %uuid, topic = %topic, "Cleared disabled control");
                report.cleared += 1;
            }
        }
        state.previous_enabled = enabled.clone();

        if enabled.is_empty() {
            state.phase = PollerPhase::Idle;
            return Ok(report);
        }
        state.phase = PollerPhase::Publishing;

        let fetcher = StateFetcher::new(self.source.clone())?;
        let snapshot = fetcher.load().await?;
        let controls = extract_controls(&snapshot);

        match self.store.sync_from(controls.iter().map(|c| c.uuid.as_str())) {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => warn!(error = %e, "Failed to persist pruned selection"),
        }

        for control in controls.iter().filter(|c| enabled.contains(&c.uuid)) {
            let message = format_message(control, Some(&fetcher)).await;
            let topic = resolve_target_topic(&self.base_topic, &control.uuid);
            if self.publish(&topic, &message).await {
                report.published += 1;
            }
        }

        Ok(report)
    }

    /// Publish, registering the echo first when the bridge would see it.
    async fn publish(&self, topic: &str, payload: &str) -> bool {
        let echoed = self.echo_topic.as_deref() == Some(topic);
        if echoed {
            self.guard.record_local(payload);
        }

        match self.publisher.publish(topic, payload).await {
            Ok(()) => true,
            Err(e) => {
                if echoed {
                    self.guard.should_ignore(payload);
                }
                error!(error = %e, topic = %topic, "Failed to publish control message");
                false
            }
        }
    }
}
