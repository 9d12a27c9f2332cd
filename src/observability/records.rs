//! Per-request and per-reconciliation records.
//!
//! Both are plain values handed to `emit`, which logs them and updates
//! the matching metrics. Tests can inspect them without a subscriber.

use std::time::Duration;

use serde::Serialize;

use crate::dynamic::types::EntityError;
use crate::observability::metrics;

/// Outcome of one proxied request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestRecord {
    pub request_id: Option<String>,
    pub router: Option<String>,
    pub service: Option<String>,
    pub target: Option<String>,
    pub status: u16,
    #[serde(serialize_with = "as_millis")]
    pub latency: Duration,
    pub attempts: u32,
    pub error_kind: Option<&'static str>,
}

impl RequestRecord {
    pub fn emit(&self) {
        metrics::record_request(
            self.router.as_deref().unwrap_or("-"),
            self.service.as_deref().unwrap_or("-"),
            self.status,
            self.latency,
        );
        tracing::info!(
            request_id = self.request_id.as_deref().unwrap_or("-"),
            router = self.router.as_deref().unwrap_or("-"),
            service = self.service.as_deref().unwrap_or("-"),
            target = self.target.as_deref().unwrap_or("-"),
            status = self.status,
            latency_ms = self.latency.as_millis() as u64,
            attempts = self.attempts,
            error = self.error_kind.unwrap_or("-"),
            "request"
        );
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconcileRecord {
    pub generation: u64,
    pub routers: usize,
    pub services: usize,
    pub targets: usize,
    pub errors: Vec<EntityError>,
    /// False when the merged configuration was unchanged.
    pub published: bool,
}

impl ReconcileRecord {
    pub fn emit(&self) {
        let outcome = match (self.published, self.errors.is_empty()) {
            (false, _) => "unchanged",
            (true, true) => "published",
            (true, false) => "published_with_errors",
        };
        metrics::record_reconciliation(outcome, self.generation, self.errors.len());

        for error in &self.errors {
            tracing::warn!(
                generation = self.generation,
                kind = %error.kind,
                entity = %error.entity,
                source = %error.source,
                reason = %error.reason,
                "Configuration error"
            );
        }
        tracing::info!(
            generation = self.generation,
            routers = self.routers,
            services = self.services,
            targets = self.targets,
            errors = self.errors.len(),
            outcome,
            "Reconciliation complete"
        );
    }
}
