//! HTTP status endpoint: exposes node state as JSON.

use axum::routing::get;
use axum::{extract::State, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

use ethwire_core::crypto::NodeId;
use ethwire_services::{ReputationRegistry, SyncStatus, WarpProgress};

use crate::session::SessionTable;

#[derive(Clone)]
pub struct StatusState {
    pub node_id: NodeId,
    pub sessions: SessionTable,
    pub reputation: ReputationRegistry,
    pub sync: watch::Receiver<SyncStatus>,
    pub warp: Option<watch::Receiver<WarpProgress>>,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub sessions: usize,
    pub sync: SyncStatus,
    /// Absent when warp sync is off.
    pub warp: Option<WarpProgress>,
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        node_id: hex::encode(state.node_id),
        sessions: state.sessions.len(),
        sync: state.sync.borrow().clone(),
        warp: state.warp.as_ref().map(|w| w.borrow().clone()),
    })
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub addr: String,
    pub client_id: String,
    pub capabilities: Vec<String>,
    pub inbound: bool,
    pub connected_secs: u64,
}

async fn handle_peers(State(state): State<StatusState>) -> Json<PeersResponse> {
    let mut peers: Vec<PeerInfo> = state
        .sessions
        .iter()
        .map(|e| {
            let meta = &e.value().meta;
            PeerInfo {
                node_id: hex::encode(meta.node_id),
                addr: meta.addr.to_string(),
                client_id: meta.client_id.clone(),
                capabilities: meta.capabilities.iter().map(|c| format!("{}/{}", c.name, c.version)).collect(),
                inbound: meta.inbound,
                connected_secs: meta.established_at.elapsed().as_secs(),
            }
        })
        .collect();
    peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    Json(PeersResponse { peers })
}

// ── /reputation ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ReputationResponse {
    pub disabled: Vec<DisabledPeer>,
}

#[derive(Serialize)]
pub struct DisabledPeer {
    pub node_id: String,
    pub reason: String,
    pub since: u64,
}

async fn handle_reputation(State(state): State<StatusState>) -> Json<ReputationResponse> {
    let mut disabled: Vec<DisabledPeer> = state
        .reputation
        .list()
        .into_iter()
        .map(|(id, entry)| DisabledPeer {
            node_id: hex::encode(id),
            reason: entry.reason,
            since: entry.since,
        })
        .collect();
    disabled.sort_by_key(|p| p.since);

    Json(ReputationResponse { disabled })
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/peers", get(handle_peers))
        .route("/reputation", get(handle_reputation))
        .with_state(state)
}

pub async fn serve(state: StatusState, port: u16, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
