//! Weighted random load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, Eligibility, LoadBalancer};

/// Picks an eligible target with probability proportional to its weight.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl WeightedRandom {
    pub fn new() -> Self {
        Self
    }
}

/// Index into `weights` drawn proportionally, or `None` when all are zero.
pub fn pick_weighted(weights: &[u64]) -> Option<usize> {
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return None;
    }
    let mut point = fastrand::u64(0..total);
    for (idx, weight) in weights.iter().enumerate() {
        if point < *weight {
            return Some(idx);
        }
        point -= weight;
    }
    None
}

impl LoadBalancer for WeightedRandom {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        eligibility: &Eligibility<'_>,
    ) -> Option<Arc<Backend>> {
        let candidates: Vec<&Arc<Backend>> =
            backends.iter().filter(|b| eligibility.allows(b)).collect();
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<u64> = candidates.iter().map(|b| u64::from(b.weight)).collect();
        // Zero weights everywhere: treat all candidates alike.
        let idx = pick_weighted(&weights).unwrap_or_else(|| fastrand::usize(0..candidates.len()));
        Some(candidates[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::HealthState;

    #[test]
    fn distribution_follows_weights() {
        let lb = WeightedRandom::new();
        let heavy = Arc::new(Backend::parse("http://127.0.0.1:1", 9, 100).unwrap());
        let light = Arc::new(Backend::parse("http://127.0.0.1:2", 1, 100).unwrap());
        let backends = vec![heavy.clone(), light.clone()];

        let mut heavy_hits = 0;
        for _ in 0..2000 {
            let s = lb.next_server(&backends, &Eligibility::default()).unwrap();
            if Arc::ptr_eq(&s, &heavy) {
                heavy_hits += 1;
            }
        }
        // Expected 1800; the bounds are loose enough to never flake.
        assert!(heavy_hits > 1500 && heavy_hits < 1990, "heavy_hits = {}", heavy_hits);
    }

    #[test]
    fn only_healthy_targets() {
        let lb = WeightedRandom::new();
        let a = Arc::new(Backend::parse("http://127.0.0.1:1", 100, 100).unwrap());
        let b = Arc::new(Backend::parse("http://127.0.0.1:2", 1, 100).unwrap());
        a.health.set_state(HealthState::Unhealthy);
        let backends = vec![a, b.clone()];
        for _ in 0..50 {
            let s = lb.next_server(&backends, &Eligibility::default()).unwrap();
            assert!(Arc::ptr_eq(&s, &b));
        }
    }

    #[test]
    fn pick_weighted_edges() {
        assert_eq!(pick_weighted(&[]), None);
        assert_eq!(pick_weighted(&[0, 0]), None);
        assert_eq!(pick_weighted(&[0, 5, 0]), Some(1));
    }
}
