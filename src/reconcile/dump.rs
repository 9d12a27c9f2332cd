//! Serializable view of a snapshot for the admin API and the CLI.

use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::dynamic::types::EntityError;
use crate::health::HealthState;
use crate::load_balancer::pool::Pool;
use crate::middleware::Middleware;
use crate::reconcile::snapshot::RoutingSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDump {
    pub generation: u64,
    pub built_at_unix_ms: u64,
    /// Precedence order, first match wins.
    pub routers: Vec<RouterDump>,
    pub services: Vec<ServiceDump>,
    pub middlewares: Vec<MiddlewareDump>,
    pub errors: Vec<ErrorDump>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDump {
    pub name: String,
    pub rule: String,
    pub priority: i64,
    pub service: String,
    pub middlewares: Vec<String>,
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDump {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticky_cookie: Option<String>,
    pub fail_open: bool,
    pub targets: Vec<TargetDump>,
    /// Weighted children as `(service, weight)`.
    pub children: Vec<(String, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDump {
    pub url: String,
    pub weight: u32,
    pub health: String,
    pub active_connections: usize,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareDump {
    pub name: String,
    pub kind: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDump {
    pub kind: String,
    pub entity: String,
    pub source: String,
    pub reason: String,
}

impl From<&EntityError> for ErrorDump {
    fn from(e: &EntityError) -> Self {
        Self {
            kind: e.kind.to_string(),
            entity: e.entity.clone(),
            source: e.source.clone(),
            reason: e.reason.clone(),
        }
    }
}

fn health_label(state: HealthState) -> String {
    match state {
        HealthState::Unknown => "unknown",
        HealthState::Healthy => "healthy",
        HealthState::Unhealthy => "unhealthy",
    }
    .to_string()
}

impl SnapshotDump {
    pub fn from_snapshot(snapshot: &RoutingSnapshot) -> Self {
        let routers = snapshot
            .routes
            .routes()
            .iter()
            .map(|r| RouterDump {
                name: r.name.clone(),
                rule: r.rule_text.clone(),
                priority: r.priority,
                service: r.service.clone(),
                middlewares: r.middlewares.clone(),
                tls: r.tls,
            })
            .collect();

        let services = snapshot
            .pools
            .iter()
            .map(|(name, pool)| match pool.as_ref() {
                Pool::Servers(p) => ServiceDump {
                    name: name.clone(),
                    kind: "load_balancer".into(),
                    strategy: Some(p.balancer.name().to_string()),
                    sticky_cookie: p.sticky.as_ref().map(|s| s.cookie.clone()),
                    fail_open: p.fail_open,
                    targets: p
                        .backends
                        .iter()
                        .map(|b| TargetDump {
                            url: b.url.to_string(),
                            weight: b.weight,
                            health: health_label(b.health_state()),
                            active_connections: b.active_count(),
                            max_connections: b.max_connections,
                        })
                        .collect(),
                    children: Vec::new(),
                },
                Pool::Weighted(w) => ServiceDump {
                    name: name.clone(),
                    kind: "weighted".into(),
                    strategy: None,
                    sticky_cookie: None,
                    fail_open: false,
                    targets: Vec::new(),
                    children: w.children.clone(),
                },
            })
            .collect();

        let middlewares = snapshot
            .middlewares
            .iter()
            .map(|(name, m)| MiddlewareDump {
                name: name.clone(),
                kind: m.config.kind().to_string(),
                source: m.source.clone(),
                state: match &m.behavior {
                    Middleware::CircuitBreaker(cb) => serde_json::to_value(cb.state())
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string)),
                    Middleware::RateLimit(rl) => Some(format!("{} clients", rl.tracked_clients())),
                    _ => None,
                },
            })
            .collect();

        let built_at_unix_ms = snapshot
            .built_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            generation: snapshot.generation,
            built_at_unix_ms,
            routers,
            services,
            middlewares,
            errors: snapshot.errors.iter().map(ErrorDump::from).collect(),
        }
    }
}
