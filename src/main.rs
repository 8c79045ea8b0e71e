use anyhow::{Context, Result};
use loxbridge::bridge::{bind_endpoint, Bridge, DatagramEndpoint};
use loxbridge::config::LoxbridgeConfig;
use loxbridge::guard::LoopGuard;
use loxbridge::mqtt::{self, MqttPublisher, Publisher};
use loxbridge::poller::{Poller, SharedPollerStatus};
use loxbridge::selection::SelectionStore;
use loxbridge::viewer::{bind_listener, create_viewer_router, ViewerAppState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loxbridge=info".into()),
        )
        .init();

    info!("Loxbridge starting...");

    let config_path = PathBuf::from(
        std::env::var("LOXBRIDGE_CONFIG").unwrap_or_else(|_| "loxbridge.toml".to_string()),
    );
    let config = LoxbridgeConfig::load(&config_path)?;

    info!(
        config = %config_path.display(),
        mqtt_host = %config.mqtt.host,
        mqtt_port = config.mqtt.port,
        topic = %config.mqtt.topic,
        "Configuration loaded"
    );

    let endpoint = if config.udp.enabled {
        match config.validate_bridge() {
            Ok(()) => match bind_endpoint(&config.udp).await {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    let reason = format!("{:#}", e);
                    error!(error = %reason, "UDP endpoint unavailable, bridge not started");
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "Bridge configuration invalid, bridge not started");
                None
            }
        }
    } else {
        info!("UDP bridge disabled");
        None
    };
    let bridge_enabled = endpoint.is_some();

    let poller_enabled = config.poller.enabled
        && match config.validate_poller() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Poller configuration invalid, poller not started");
                false
            }
        };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let guard = Arc::new(LoopGuard::new());
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    let store = Arc::new(SelectionStore::open(&config.poller.selection_path));
    let mut poller_status: Option<SharedPollerStatus> = None;

    if bridge_enabled || poller_enabled {
        let (client, event_loop) = mqtt::connect(&config.mqtt);
        let publisher: Arc<dyn Publisher> =
            Arc::new(MqttPublisher::new(client.clone(), config.mqtt.qos()));

        let inbound_tx = endpoint.map(|DatagramEndpoint { socket, target }| {
            let bridge = Arc::new(Bridge::new(
                config.mqtt.topic.clone(),
                target,
                Arc::clone(&guard),
                Arc::clone(&publisher),
            ));
            let (inbound_tx, inbound_rx) = mpsc::channel(100);
            handles.push(tokio::spawn(
                Arc::clone(&bridge).run_inbound(inbound_rx, shutdown_rx.clone()),
            ));
            handles.push(tokio::spawn(bridge.run_outbound(socket, shutdown_rx.clone())));
            inbound_tx
        });

        handles.push(tokio::spawn(mqtt::run_event_loop(
            event_loop,
            client,
            config.mqtt.topic.clone(),
            config.mqtt.qos(),
            inbound_tx,
            shutdown_rx.clone(),
        )));

        if poller_enabled {
            let mut poller = Poller::new(
                &config.poller,
                config.source.clone(),
                Arc::clone(&store),
                Arc::clone(&guard),
                publisher,
            );
            if bridge_enabled {
                poller = poller.with_echo_topic(config.mqtt.topic.clone());
            }
            poller_status = Some(poller.status());
            handles.push(tokio::spawn(poller.run(shutdown_rx.clone())));
        }
    } else {
        warn!("Neither bridge nor poller is running");
    }

    // The server is aborted on shutdown rather than joined
    let mut viewer_handle = None;
    if config.viewer.enabled {
        match bind_listener(&config.viewer).await {
            Ok(listener) => {
                let router = create_viewer_router(ViewerAppState {
                    source: config.source.clone(),
                    store: Arc::clone(&store),
                    poller_status,
                });
                info!(bind = %config.viewer.bind, "Viewer API listening");

                viewer_handle = Some(tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, router).await {
                        error!(error = %e, "Viewer API server error");
                    }
                }));
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(error = %reason, "Viewer not started");
            }
        }
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    let _ = shutdown_tx.send(true);
    if let Some(handle) = viewer_handle {
        handle.abort();
    }
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "Task ended abnormally");
        }
    }
    info!("Loxbridge stopped");

    Ok(())
}
