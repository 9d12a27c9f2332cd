//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe request outcomes
//! - Feed them into the same hysteresis counters as active probes
//!
//! # Design Decisions
//! - Only connection errors, timeouts and 502/503/504 count as failures
//! - Other 5xx come from the application, not from an unreachable target
//! - 4xx are NOT failures (client error, not backend)

use axum::http::StatusCode;

use crate::health::state::{HealthState, Thresholds};
use crate::load_balancer::backend::Backend;

/// What happened to one forwarded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Response(StatusCode),
    ConnectError,
    Timeout,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        match self {
            Outcome::Response(status) => matches!(
                *status,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            ),
            Outcome::ConnectError | Outcome::Timeout => true,
        }
    }
}

/// Record a request outcome against the target.
pub fn observe(service: &str, backend: &Backend, outcome: Outcome, thresholds: Thresholds) {
    if let Some(t) = backend.health.record(!outcome.is_failure(), thresholds) {
        if t.to == HealthState::Unhealthy {
            tracing::warn!(service = %service, target = %backend.authority, outcome = ?outcome, "Target marked unhealthy by request outcomes");
        } else {
            tracing::info!(service = %service, target = %backend.authority, "Target recovered on request outcomes");
        }
    }
}
