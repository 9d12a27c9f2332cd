use std::time::UNIX_EPOCH;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::reconcile::dump::{ErrorDump, RouterDump, ServiceDump, SnapshotDump};

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub generation: u64,
    pub built_at_unix_ms: u64,
    pub uptime_secs: u64,
    pub routers: usize,
    pub services: usize,
    pub targets: usize,
    pub errors: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let snapshot = state.snapshots.load();
    let built_at_unix_ms = snapshot
        .built_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: if snapshot.errors.is_empty() { "operational" } else { "degraded" }.to_string(),
        generation: snapshot.generation,
        built_at_unix_ms,
        uptime_secs: state.started.elapsed().as_secs(),
        routers: snapshot.routes.len(),
        services: snapshot.pools.len(),
        targets: snapshot.pools.target_count(),
        errors: snapshot.errors.len(),
    })
}

pub async fn get_snapshot(State(state): State<AdminState>) -> Json<SnapshotDump> {
    Json(SnapshotDump::from_snapshot(&state.snapshots.load()))
}

pub async fn get_routers(State(state): State<AdminState>) -> Json<Vec<RouterDump>> {
    Json(SnapshotDump::from_snapshot(&state.snapshots.load()).routers)
}

pub async fn get_services(State(state): State<AdminState>) -> Json<Vec<ServiceDump>> {
    Json(SnapshotDump::from_snapshot(&state.snapshots.load()).services)
}

pub async fn get_errors(State(state): State<AdminState>) -> Json<Vec<ErrorDump>> {
    let snapshot = state.snapshots.load();
    Json(snapshot.errors.iter().map(ErrorDump::from).collect())
}
