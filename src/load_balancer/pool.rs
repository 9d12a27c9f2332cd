//! Service pool management.
//!
//! # Responsibilities
//! - Build one pool per service of a Dynamic Configuration
//! - Carry over unchanged targets (and their health/in-flight state)
//! - Apply load balancing algorithms to select targets
//! - Provide connection guards for tracking

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};

use crate::config::schema::{HealthCheckConfig, ProxyConfig};
use crate::dynamic::types::{DynamicConfig, EntityError, EntityKind, ServiceConfig};
use crate::health::active::ProbeSettings;
use crate::load_balancer::backend::{Backend, BackendConnectionGuard};
use crate::load_balancer::sticky::Sticky;
use crate::load_balancer::weighted::pick_weighted;
use crate::load_balancer::{Balancer, Eligibility, LoadBalancer};

/// Nesting limit for weighted services. Cycles are rejected at merge time.
const MAX_DEPTH: usize = 8;

/// Global defaults applied while building pools.
#[derive(Debug, Clone)]
pub struct PoolDefaults {
    pub fail_open: bool,
    pub max_connections: usize,
    pub health: HealthCheckConfig,
}

impl PoolDefaults {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            fail_open: config.dispatch.fail_open,
            max_connections: config.dispatch.max_connections_per_target,
            health: config.health_check.clone(),
        }
    }
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Targets of a load-balanced service.
#[derive(Debug)]
pub struct ServerPool {
    pub name: String,
    pub backends: Vec<Arc<Backend>>,
    pub balancer: Balancer,
    pub sticky: Option<Sticky>,
    pub fail_open: bool,
    pub pass_host_header: bool,
    pub probe: ProbeSettings,
}

/// A service that spreads traffic over other services.
#[derive(Debug)]
pub struct WeightedPool {
    pub name: String,
    pub children: Vec<(String, u32)>,
}

#[derive(Debug)]
pub enum Pool {
    Servers(ServerPool),
    Weighted(WeightedPool),
}

/// Per-request selection input.
#[derive(Debug, Clone, Copy)]
pub struct SelectRequest<'a> {
    pub headers: &'a HeaderMap,
    /// Targets already tried by this request.
    pub exclude: &'a [Arc<Backend>],
}

/// A target chosen for one attempt.
#[derive(Debug)]
pub struct Selected {
    pub guard: BackendConnectionGuard,
    /// Leaf service that owns the target.
    pub service: String,
    pub set_cookie: Option<HeaderValue>,
    pub pass_host_header: bool,
    /// Chosen despite being unhealthy.
    pub failed_open: bool,
    pub probe: ProbeSettings,
}

impl Selected {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.guard.backend
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("service `{0}` not found")]
    NotFound(String),
    #[error("service `{0}` has no routable target")]
    NoHealthyTarget(String),
    #[error("every target of service `{0}` is at its connection limit")]
    Saturated(String),
    #[error("service `{0}` nests too deeply")]
    TooDeep(String),
}

impl ServerPool {
    fn select(&self, req: &SelectRequest<'_>) -> Result<Selected, SelectError> {
        if self.backends.is_empty() {
            return Err(SelectError::NoHealthyTarget(self.name.clone()));
        }

        let cookie = self
            .sticky
            .as_ref()
            .and_then(|s| s.cookie_value(req.headers));
        let mut skipped: Vec<Arc<Backend>> = req.exclude.to_vec();
        let mut saturated = false;

        for ignore_health in [false, true] {
            // Unhealthy targets serve only when no target is routable at all.
            if ignore_health && (!self.fail_open || self.backends.iter().any(|b| b.is_healthy())) {
                break;
            }

            if let (Some(sticky), Some(value)) = (&self.sticky, &cookie) {
                let pinned = sticky.pinned(
                    value,
                    &self.backends,
                    &Eligibility {
                        exclude: &skipped,
                        ignore_health,
                    },
                );
                if let Some(backend) = pinned {
                    match backend.try_create_guard() {
                        Some(guard) => return Ok(self.selected(guard, ignore_health, false)),
                        None => {
                            saturated = true;
                            skipped.push(backend);
                        }
                    }
                }
            }

            loop {
                let next = self.balancer.next_server(
                    &self.backends,
                    &Eligibility {
                        exclude: &skipped,
                        ignore_health,
                    },
                );
                let Some(backend) = next else { break };
                match backend.try_create_guard() {
                    Some(guard) => {
                        return Ok(self.selected(guard, ignore_health, cookie.is_none()));
                    }
                    None => {
                        saturated = true;
                        skipped.push(backend);
                    }
                }
            }
        }

        if saturated {
            Err(SelectError::Saturated(self.name.clone()))
        } else {
            Err(SelectError::NoHealthyTarget(self.name.clone()))
        }
    }

    fn selected(&self, guard: BackendConnectionGuard, failed_open: bool, pin: bool) -> Selected {
        let set_cookie = if pin {
            self.sticky.as_ref().and_then(|s| s.set_cookie(&guard))
        } else {
            None
        };
        Selected {
            service: self.name.clone(),
            set_cookie,
            pass_host_header: self.pass_host_header,
            failed_open,
            probe: self.probe.clone(),
            guard,
        }
    }
}

/// All pools of one snapshot.
#[derive(Debug, Default)]
pub struct PoolSet {
    pools: BTreeMap<String, Arc<Pool>>,
}

impl PoolSet {
    /// Build pools for every service. Pure with respect to `previous`:
    /// targets are shared, never mutated.
    pub fn build(
        config: &DynamicConfig,
        previous: &PoolSet,
        defaults: &PoolDefaults,
    ) -> (Self, Vec<EntityError>) {
        let mut errors = Vec::new();
        let mut pools = BTreeMap::new();

        for (name, service) in &config.services {
            let pool = match &service.config {
                ServiceConfig::LoadBalancer(lb) => {
                    let balancer = match lb.strategy.as_deref() {
                        None => Balancer::default(),
                        Some(strategy) => Balancer::from_name(strategy).unwrap_or_else(|| {
                            tracing::warn!(service = %name, strategy = %strategy, "Unknown load-balancing strategy, using round_robin");
                            errors.push(EntityError::new(
                                EntityKind::Service,
                                name,
                                &service.source,
                                format!("unknown load-balancing strategy `{}`, using round_robin", strategy),
                            ));
                            Balancer::default()
                        }),
                    };

                    let carried: &[Arc<Backend>] = previous
                        .server_pool(name)
                        .map(|p| p.backends.as_slice())
                        .unwrap_or(&[]);
                    let mut backends: Vec<Arc<Backend>> = Vec::with_capacity(lb.servers.len());
                    for server in &lb.servers {
                        let max = server.max_connections.unwrap_or(defaults.max_connections);
                        let reused = carried.iter().find(|b| {
                            b.same_target(&server.url, server.weight, max)
                                && !backends.iter().any(|x| Arc::ptr_eq(x, b))
                        });
                        if let Some(backend) = reused {
                            backends.push(backend.clone());
                            continue;
                        }
                        match Backend::parse(&server.url, server.weight, max) {
                            Ok(backend) => backends.push(Arc::new(backend)),
                            Err(e) => {
                                tracing::warn!(service = %name, url = %server.url, error = %e, "Excluding target");
                                errors.push(EntityError::new(
                                    EntityKind::Service,
                                    name,
                                    &service.source,
                                    e.to_string(),
                                ));
                            }
                        }
                    }
                    if backends.is_empty() {
                        tracing::warn!(service = %name, "Service has no targets; requests will be answered 503");
                    }

                    Pool::Servers(ServerPool {
                        name: name.clone(),
                        backends,
                        balancer,
                        sticky: lb.sticky.as_ref().map(|s| Sticky::new(s.cookie.clone())),
                        fail_open: lb.fail_open.unwrap_or(defaults.fail_open),
                        pass_host_header: lb.pass_host_header.unwrap_or(true),
                        probe: ProbeSettings::resolve(&defaults.health, lb.health_check.as_ref()),
                    })
                }
                ServiceConfig::Weighted(weighted) => Pool::Weighted(WeightedPool {
                    name: name.clone(),
                    children: weighted
                        .services
                        .iter()
                        .map(|c| (c.name.clone(), c.weight))
                        .collect(),
                }),
            };
            pools.insert(name.clone(), Arc::new(pool));
        }

        (Self { pools }, errors)
    }

    /// Select a target for `service`.
    /// Returns a guard that decrements the in-flight count on drop.
    pub fn select(&self, service: &str, req: &SelectRequest<'_>) -> Result<Selected, SelectError> {
        self.select_at(service, req, 0)
    }

    fn select_at(
        &self,
        service: &str,
        req: &SelectRequest<'_>,
        depth: usize,
    ) -> Result<Selected, SelectError> {
        if depth > MAX_DEPTH {
            return Err(SelectError::TooDeep(service.to_string()));
        }
        let pool = self
            .pools
            .get(service)
            .ok_or_else(|| SelectError::NotFound(service.to_string()))?;

        match pool.as_ref() {
            Pool::Servers(servers) => servers.select(req),
            Pool::Weighted(weighted) => {
                // Weight 0 disables a child.
                let mut remaining: Vec<&(String, u32)> =
                    weighted.children.iter().filter(|(_, w)| *w > 0).collect();
                let mut last = SelectError::NoHealthyTarget(service.to_string());
                while !remaining.is_empty() {
                    let weights: Vec<u64> = remaining.iter().map(|(_, w)| u64::from(*w)).collect();
                    let idx = pick_weighted(&weights).unwrap_or(0);
                    let (child, _) = remaining.remove(idx);
                    match self.select_at(child, req, depth + 1) {
                        Ok(selected) => return Ok(selected),
                        Err(e) => last = e,
                    }
                }
                Err(last)
            }
        }
    }

    pub fn get(&self, service: &str) -> Option<&Arc<Pool>> {
        self.pools.get(service)
    }

    pub fn server_pool(&self, service: &str) -> Option<&ServerPool> {
        match self.pools.get(service)?.as_ref() {
            Pool::Servers(p) => Some(p),
            Pool::Weighted(_) => None,
        }
    }

    /// Pools in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Pool>)> {
        self.pools.iter()
    }

    /// Every load-balanced pool (for health checking).
    pub fn server_pools(&self) -> impl Iterator<Item = &ServerPool> {
        self.pools.values().filter_map(|p| match p.as_ref() {
            Pool::Servers(s) => Some(s),
            Pool::Weighted(_) => None,
        })
    }

    pub fn target_count(&self) -> usize {
        self.server_pools().map(|p| p.backends.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
