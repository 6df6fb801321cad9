//! HTTP status API for a fleet node.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use fleet_learning::{FleetStatus, Learner, LoopState};
use fleet_metadata::{codec, PeerId, PeerRecord, TrustLevel};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub learner: Arc<Learner>,
    /// Our own signed record.
    pub local: PeerRecord,
}

type AppState = Arc<ApiState>;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    // CORS layer for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Fleet (at root and under /api/v1)
        .route("/status", get(status))
        .route("/known_nodes", get(list_known_nodes))
        .route("/api/v1/status", get(status))
        .route("/api/v1/metadata", get(local_metadata))
        .route("/api/v1/known_nodes", get(list_known_nodes))
        .route("/api/v1/known_nodes/:id", get(get_known_node))
        .layer(cors)
        .with_state(state)
}

// --- Health endpoints ---

async fn health() -> &'static str {
    "OK"
}

/// Ready once at least one teacher proved its endpoint and the loop is alive.
async fn ready(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    let learner = &state.learner;
    let verified = learner
        .known()
        .count(|r| r.trust_level >= TrustLevel::NetworkVerified);
    if learner.state() == LoopState::Stopped || verified == 0 {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok("OK")
}

// --- Fleet endpoints ---

async fn status(State(state): State<AppState>) -> Json<FleetStatus> {
    Json(state.learner.status())
}

#[derive(Debug, Serialize)]
pub struct NodeView {
    pub id: String,
    pub address: String,
    pub trust_level: TrustLevel,
    pub signed_at: u64,
    pub flagged: bool,
    /// Hex of the encoded metadata, loadable as a teacher file.
    pub metadata: String,
}

impl From<&PeerRecord> for NodeView {
    fn from(record: &PeerRecord) -> Self {
        Self {
            id: record.id().to_hex(),
            address: record.address().to_string(),
            trust_level: record.trust_level,
            signed_at: record.signed_at(),
            flagged: record.flagged,
            metadata: codec::to_hex(record),
        }
    }
}

async fn local_metadata(State(state): State<AppState>) -> Json<NodeView> {
    Json(NodeView::from(&state.local))
}

async fn list_known_nodes(State(state): State<AppState>) -> Json<Vec<NodeView>> {
    let nodes = state
        .learner
        .known()
        .snapshot()
        .iter()
        .map(NodeView::from)
        .collect();
    Json(nodes)
}

async fn get_known_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NodeView>, StatusCode> {
    let id = PeerId::from_hex(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    match state.learner.known().get(&id) {
        Some(record) => Ok(Json(NodeView::from(&record))),
        None => Err(StatusCode::NOT_FOUND),
    }
}
