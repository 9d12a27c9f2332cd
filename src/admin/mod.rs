//! Read-only introspection API.
//!
//! Serves the current snapshot as JSON. Nothing here mutates routing state;
//! topology changes only arrive through providers.

pub mod auth;
pub mod handlers;

use std::time::Instant;

use axum::{middleware, routing::get, Router};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::reconcile::SnapshotHandle;

#[derive(Clone)]
pub struct AdminState {
    pub snapshots: SnapshotHandle,
    pub api_key: String,
    pub started: Instant,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/snapshot", get(get_snapshot))
        .route("/admin/routers", get(get_routers))
        .route("/admin/services", get(get_services))
        .route("/admin/errors", get(get_errors))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
