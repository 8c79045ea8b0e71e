//! JSON API backing the control selection viewer.

use crate::config::ViewerConfig;
use crate::loxone::{
    extract_controls, snapshot_metadata, Control, FetchError, SnapshotMetadata, SourceConfig,
    StateFetcher,
};
use crate::poller::SharedPollerStatus;
use crate::selection::SelectionStore;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// State for the viewer API.
#[derive(Clone)]
pub struct ViewerAppState {
    pub source: SourceConfig,
    pub store: Arc<SelectionStore>,
    /// None when the poller is not running
    pub poller_status: Option<SharedPollerStatus>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct ControlView {
    #[serde(flatten)]
    control: Control,
    enabled: bool,
}

#[derive(Serialize)]
struct ControlsResponse {
    metadata: SnapshotMetadata,
    controls: Vec<ControlView>,
}

#[derive(Deserialize)]
pub struct EnabledUpdate {
    pub enabled: bool,
}

#[derive(Serialize)]
struct EnabledResponse {
    uuid: String,
    enabled: bool,
}

pub fn create_viewer_router(state: ViewerAppState) -> Router {
    Router::new()
        .route("/api/controls", get(list_controls))
        .route("/api/controls/:uuid/enabled", put(set_enabled))
        .route("/api/poller", get(poller_status))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Bind the viewer listen address. A failure disables the viewer only.
pub async fn bind_listener(config: &ViewerConfig) -> Result<TcpListener> {
    TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind viewer address {}", config.bind))
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// GET /api/controls: fresh snapshot plus selection flags.
async fn list_controls(State(state): State<Arc<ViewerAppState>>) -> Response {
    let fetched = match StateFetcher::new(state.source.clone()) {
        Ok(fetcher) => fetcher.load().await,
        Err(e) => Err(e),
    };

    let snapshot = match fetched {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "Failed to load structure file for viewer");
            let status = if e.is_upstream() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let message = match e {
                FetchError::Http { .. } | FetchError::Request { .. } => {
                    format!("failed to fetch data: {}", e)
                }
                _ => e.to_string(),
            };
            return error_response(status, message);
        }
    };

    let controls = extract_controls(&snapshot);
    if let Err(e) = state.store.sync_from(controls.iter().map(|c| c.uuid.as_str())) {
        warn!(error = %e, "Failed to persist pruned selection");
    }

    let controls = controls
        .into_iter()
        .map(|control| ControlView {
            enabled: state.store.is_enabled(&control.uuid),
            control,
        })
        .collect();

    Json(ControlsResponse {
        metadata: snapshot_metadata(&snapshot),
        controls,
    })
    .into_response()
}

/// PUT /api/controls/:uuid/enabled
async fn set_enabled(
    State(state): State<Arc<ViewerAppState>>,
    Path(uuid): Path<String>,
    Json(update): Json<EnabledUpdate>,
) -> Response {
    if let Err(e) = state.store.set_enabled(&uuid, update.enabled) {
        error!(error = %e, uuid = %uuid, "Failed to persist selection");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }

    info!(uuid = %uuid, enabled = update.enabled, "Selection updated");
    Json(EnabledResponse {
        uuid,
        enabled: update.enabled,
    })
    .into_response()
}

/// GET /api/poller
async fn poller_status(State(state): State<Arc<ViewerAppState>>) -> Response {
    match &state.poller_status {
        Some(status) => {
            let snapshot = status.lock().unwrap().clone();
            Json(snapshot).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "poller is not running"),
    }
}
