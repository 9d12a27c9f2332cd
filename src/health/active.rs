//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every target of the current snapshot
//! - Update target health state based on results
//!
//! The monitor reads the snapshot afresh on every tick, so targets added
//! by a reconciliation are probed without restarting it, and targets that
//! survive a reload keep their state because they are the same objects.
//!
//! Each probe runs as its own task. A target whose previous probe is still
//! running is skipped for that round; pending probes are aborted on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dashmap::DashSet;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use crate::config::schema::HealthCheckConfig;
use crate::dynamic::types::{ProbeKind, ServiceHealthCheck};
use crate::health::state::{HealthState, Thresholds};
use crate::load_balancer::backend::Backend;
use crate::observability::metrics;
use crate::reconcile::SnapshotHandle;

/// Probe settings of one service: global defaults plus its overrides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSettings {
    pub enabled: bool,
    pub kind: ProbeKind,
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub thresholds: Thresholds,
}

impl ProbeSettings {
    pub fn resolve(global: &HealthCheckConfig, overrides: Option<&ServiceHealthCheck>) -> Self {
        let o = overrides.cloned().unwrap_or_default();
        Self {
            enabled: o.enabled.unwrap_or(global.enabled),
            kind: o.kind.unwrap_or(global.kind),
            path: o.path.unwrap_or_else(|| global.path.clone()),
            interval_secs: o.interval_secs.unwrap_or(global.interval_secs).max(1),
            timeout_secs: o.timeout_secs.unwrap_or(global.timeout_secs).max(1),
            thresholds: Thresholds {
                healthy: o.healthy_threshold.unwrap_or(global.healthy_threshold).max(1),
                unhealthy: o.unhealthy_threshold.unwrap_or(global.unhealthy_threshold).max(1),
            },
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self::resolve(&HealthCheckConfig::default(), None)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Connect(String),
    #[error("non-success status {0}")]
    Status(StatusCode),
    #[error("invalid probe request: {0}")]
    Request(String),
}

/// Probe one target once.
pub async fn probe(
    client: &Client<HttpConnector, Body>,
    backend: &Backend,
    settings: &ProbeSettings,
) -> Result<(), ProbeError> {
    match settings.kind {
        ProbeKind::Tcp => {
            match time::timeout(settings.timeout(), TcpStream::connect(&backend.authority)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(ProbeError::Connect(e.to_string())),
                Err(_) => Err(ProbeError::Timeout),
            }
        }
        ProbeKind::Http => {
            let uri = format!("http://{}{}", backend.authority, settings.path);
            let request = Request::builder()
                .method("GET")
                .uri(uri)
                .header("user-agent", "edge-proxy-health-check")
                .body(Body::empty())
                .map_err(|e| ProbeError::Request(e.to_string()))?;

            match time::timeout(settings.timeout(), client.request(request)).await {
                Ok(Ok(response)) if response.status().is_success() => Ok(()),
                Ok(Ok(response)) => Err(ProbeError::Status(response.status())),
                Ok(Err(e)) => Err(ProbeError::Connect(e.to_string())),
                Err(_) => Err(ProbeError::Timeout),
            }
        }
    }
}

pub struct HealthMonitor {
    snapshots: SnapshotHandle,
    client: Client<HttpConnector, Body>,
    tick: Duration,
    in_flight: Arc<DashSet<usize>>,
}

impl HealthMonitor {
    pub fn new(snapshots: SnapshotHandle) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            snapshots,
            client,
            tick: Duration::from_secs(1),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Granularity at which per-service intervals are checked.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "Health monitor starting");

        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut last_run: HashMap<String, Instant> = HashMap::new();
        let mut probes = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_due(&mut last_run, &mut probes);
                }
                Some(done) = probes.join_next() => {
                    if let Err(e) = done {
                        tracing::warn!(error = %e, "Health probe task failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
        probes.abort_all();
    }

    /// Launch probes for the services whose interval has elapsed.
    fn check_due(&self, last_run: &mut HashMap<String, Instant>, probes: &mut JoinSet<()>) {
        let snapshot = self.snapshots.load();
        let now = Instant::now();

        for pool in snapshot.pools.server_pools() {
            if !pool.probe.enabled {
                continue;
            }
            let due = last_run
                .get(&pool.name)
                .map(|at| now.duration_since(*at) >= pool.probe.interval())
                .unwrap_or(true);
            if !due {
                continue;
            }
            last_run.insert(pool.name.clone(), now);

            for backend in &pool.backends {
                let Some(slot) = ProbeSlot::claim(&self.in_flight, backend) else {
                    tracing::debug!(service = %pool.name, target = %backend.authority, "Previous probe still running");
                    continue;
                };
                probes.spawn(check_one(
                    self.client.clone(),
                    pool.name.clone(),
                    backend.clone(),
                    pool.probe.clone(),
                    slot,
                ));
            }
        }
        // Services removed from the snapshot stop being tracked.
        last_run.retain(|name, _| snapshot.pools.get(name).is_some());
    }
}

/// Marks a target as being probed until dropped.
struct ProbeSlot {
    in_flight: Arc<DashSet<usize>>,
    key: usize,
}

impl ProbeSlot {
    fn claim(in_flight: &Arc<DashSet<usize>>, backend: &Arc<Backend>) -> Option<Self> {
        let key = Arc::as_ptr(backend) as usize;
        in_flight.insert(key).then(|| Self {
            in_flight: in_flight.clone(),
            key,
        })
    }
}

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

async fn check_one(
    client: Client<HttpConnector, Body>,
    service: String,
    backend: Arc<Backend>,
    settings: ProbeSettings,
    _slot: ProbeSlot,
) {
    let result = probe(&client, &backend, &settings).await;
    if let Err(e) = &result {
        tracing::debug!(service = %service, target = %backend.authority, error = %e, "Health probe failed");
    }

    if let Some(t) = backend.health.record(result.is_ok(), settings.thresholds) {
        match t.to {
            HealthState::Unhealthy => tracing::warn!(
                service = %service,
                target = %backend.authority,
                from = ?t.from,
                "Target marked unhealthy"
            ),
            _ => tracing::info!(
                service = %service,
                target = %backend.authority,
                from = ?t.from,
                "Target marked healthy"
            ),
        }
    }
    metrics::record_backend_health(&service, &backend.authority, backend.is_healthy());
}
