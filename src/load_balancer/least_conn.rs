//! Least Connections load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, Eligibility, LoadBalancer};

/// Least connections selector.
/// Selects the backend with the minimum number of in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections {
    /// Rotates the scan start so ties do not always land on the first target.
    counter: AtomicUsize,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        eligibility: &Eligibility<'_>,
    ) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = backends.len();
        let mut best: Option<&Arc<Backend>> = None;

        for i in 0..len {
            let candidate = &backends[(start + i) % len];
            if !eligibility.allows(candidate) {
                continue;
            }
            match best {
                Some(current) if current.active_count() <= candidate.active_count() => {}
                _ => best = Some(candidate),
            }
        }
        best.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::HealthState;

    fn backend(port: u16) -> Arc<Backend> {
        Arc::new(Backend::parse(&format!("http://127.0.0.1:{}", port), 1, 100).unwrap())
    }

    #[test]
    fn test_least_conn() {
        let lb = LeastConnections::new();
        let b1 = backend(8080);
        let b2 = backend(8081);

        // artificially increase connections on b1
        b1.inc_connections();

        let backends = vec![b1.clone(), b2.clone()];
        let any = Eligibility::default();

        // Should pick b2 (0 connections)
        let s1 = lb.next_server(&backends, &any).unwrap();
        assert_eq!(s1.authority, b2.authority);

        // increase b2
        b2.inc_connections();
        b2.inc_connections(); // now b2 has 2, b1 has 1

        // Should pick b1 (1 connection)
        let s2 = lb.next_server(&backends, &any).unwrap();
        assert_eq!(s2.authority, b1.authority);
    }

    #[test]
    fn ties_rotate() {
        let lb = LeastConnections::new();
        let backends = vec![backend(8080), backend(8081), backend(8082)];
        let any = Eligibility::default();
        let picks: Vec<String> = (0..3)
            .map(|_| lb.next_server(&backends, &any).unwrap().authority.clone())
            .collect();
        assert_eq!(picks, vec!["127.0.0.1:8080", "127.0.0.1:8081", "127.0.0.1:8082"]);
    }

    #[test]
    fn skips_unhealthy_even_when_idle() {
        let lb = LeastConnections::new();
        let idle = backend(8080);
        let busy = backend(8081);
        idle.health.set_state(HealthState::Unhealthy);
        busy.inc_connections();
        let backends = vec![idle, busy.clone()];
        for _ in 0..5 {
            let s = lb.next_server(&backends, &Eligibility::default()).unwrap();
            assert!(Arc::ptr_eq(&s, &busy));
        }
    }
}
