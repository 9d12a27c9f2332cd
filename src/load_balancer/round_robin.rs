//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, Eligibility, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate through backends.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        eligibility: &Eligibility<'_>,
    ) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        // Skip ineligible targets; one full lap at most.
        let start_count = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = backends.len();

        for i in 0..len {
            let index = (start_count + i) % len;
            let backend = &backends[index];
            if eligibility.allows(backend) {
                return Some(backend.clone());
            }
        }
        None
    }
}
