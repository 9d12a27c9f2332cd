//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → service identified
//!     → pool.rs (look up the service pool in the snapshot)
//!     → sticky.rs (cookie pins a target, if configured and routable)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through targets)
//!         - weighted.rs (weight-proportional random pick)
//!         - least_conn.rs (pick target with fewest in-flight requests)
//!     → backend.rs (acquire in-flight slot)
//!     → Return connection guard or SelectError
//! ```
//!
//! # Design Decisions
//! - Strategies are a closed enum resolved once per snapshot
//! - Strategies only read target state; pools never mutate it except counters
//! - Unhealthy targets excluded from selection unless the pool fails open
//! - Pools are rebuilt per snapshot; unchanged targets are carried over

pub mod backend;
pub mod least_conn;
pub mod pool;
pub mod round_robin;
pub mod sticky;
pub mod weighted;

use std::sync::Arc;

use crate::load_balancer::backend::Backend;
use crate::load_balancer::least_conn::LeastConnections;
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::weighted::WeightedRandom;

pub use pool::{PoolDefaults, PoolSet, SelectError, Selected};

/// Which targets a strategy may pick for one selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Eligibility<'a> {
    /// Targets already tried by this request.
    pub exclude: &'a [Arc<Backend>],
    /// Pick among unhealthy targets too (fail-open pass).
    pub ignore_health: bool,
}

impl<'a> Eligibility<'a> {
    pub fn healthy_only(exclude: &'a [Arc<Backend>]) -> Self {
        Self {
            exclude,
            ignore_health: false,
        }
    }

    pub fn any_health(exclude: &'a [Arc<Backend>]) -> Self {
        Self {
            exclude,
            ignore_health: true,
        }
    }

    pub fn allows(&self, backend: &Arc<Backend>) -> bool {
        if self.exclude.iter().any(|b| Arc::ptr_eq(b, backend)) {
            return false;
        }
        self.ignore_health || backend.is_healthy()
    }
}

/// Trait for load balancing algorithms.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// Select the next target among those `eligibility` allows.
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        eligibility: &Eligibility<'_>,
    ) -> Option<Arc<Backend>>;
}

/// The closed set of strategies a service can use.
#[derive(Debug)]
pub enum Balancer {
    RoundRobin(RoundRobin),
    Weighted(WeightedRandom),
    LeastConnections(LeastConnections),
}

impl Balancer {
    /// Resolve a strategy name; `None` means unknown.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" | "wrr" => Some(Balancer::RoundRobin(RoundRobin::new())),
            "weighted" | "random" => Some(Balancer::Weighted(WeightedRandom::new())),
            "least_connections" | "least_conn" | "leastconn" => {
                Some(Balancer::LeastConnections(LeastConnections::new()))
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Balancer::RoundRobin(_) => "round_robin",
            Balancer::Weighted(_) => "weighted",
            Balancer::LeastConnections(_) => "least_connections",
        }
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Balancer::RoundRobin(RoundRobin::new())
    }
}

impl LoadBalancer for Balancer {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        eligibility: &Eligibility<'_>,
    ) -> Option<Arc<Backend>> {
        match self {
            Balancer::RoundRobin(lb) => lb.next_server(backends, eligibility),
            Balancer::Weighted(lb) => lb.next_server(backends, eligibility),
            Balancer::LeastConnections(lb) => lb.next_server(backends, eligibility),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::HealthState;

    #[test]
    fn strategy_names() {
        assert_eq!(Balancer::from_name("round_robin").unwrap().name(), "round_robin");
        assert_eq!(Balancer::from_name("Least-Connections").unwrap().name(), "least_connections");
        assert_eq!(Balancer::from_name("weighted").unwrap().name(), "weighted");
        assert!(Balancer::from_name("fastest").is_none());
    }

    #[test]
    fn eligibility_filters() {
        let a = Arc::new(Backend::parse("http://127.0.0.1:1", 1, 10).unwrap());
        let b = Arc::new(Backend::parse("http://127.0.0.1:2", 1, 10).unwrap());
        b.health.set_state(HealthState::Unhealthy);
        let tried = vec![a.clone()];

        assert!(!Eligibility::healthy_only(&tried).allows(&a));
        assert!(!Eligibility::healthy_only(&[]).allows(&b));
        assert!(Eligibility::any_health(&[]).allows(&b));
    }
}
