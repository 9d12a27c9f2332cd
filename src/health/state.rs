//! Target health state machine.
//!
//! # States
//! - Unknown: no probe has completed yet; routed optimistically
//! - Healthy: target receives traffic
//! - Unhealthy: target excluded from load balancing
//!
//! # State Transitions
//! ```text
//! Unknown   → Healthy:   first success
//! Unknown   → Unhealthy: consecutive failures >= unhealthy_threshold
//! Healthy   → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unhealthy → Healthy:   consecutive successes >= healthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Lock-free: every field is an atomic scoped to one target
//! - The caller logs transitions; this module only reports them

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// A state change reported by [`TargetHealth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Consecutive-outcome counts required to change state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    pub healthy: u32,
    pub unhealthy: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            healthy: 2,
            unhealthy: 3,
        }
    }
}

/// Mutable health of one target.
#[derive(Debug, Default)]
pub struct TargetHealth {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl TargetHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Healthy or Unknown. Unknown targets are routed optimistically.
    pub fn is_routable(&self) -> bool {
        self.state() != HealthState::Unhealthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    /// Record a successful probe or request.
    pub fn record_success(&self, healthy_threshold: u32) -> Option<Transition> {
        self.consecutive_failures.store(0, Ordering::Relaxed);

        let current = self.state();
        if current == HealthState::Healthy {
            return None;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        let required = match current {
            HealthState::Unknown => 1,
            _ => healthy_threshold.max(1),
        };
        if successes >= required {
            return self.transition(current, HealthState::Healthy);
        }
        None
    }

    /// Record a failed probe or request.
    pub fn record_failure(&self, unhealthy_threshold: u32) -> Option<Transition> {
        self.consecutive_successes.store(0, Ordering::Relaxed);

        let current = self.state();
        if current == HealthState::Unhealthy {
            return None;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= unhealthy_threshold.max(1) {
            return self.transition(current, HealthState::Unhealthy);
        }
        None
    }

    /// Record an outcome against a pair of thresholds.
    pub fn record(&self, success: bool, thresholds: Thresholds) -> Option<Transition> {
        if success {
            self.record_success(thresholds.healthy)
        } else {
            self.record_failure(thresholds.unhealthy)
        }
    }

    /// Force a state, e.g. when adopting state from elsewhere in tests.
    pub fn set_state(&self, state: HealthState) {
        self.state.store(state as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }

    fn transition(&self, from: HealthState, to: HealthState) -> Option<Transition> {
        // Only the caller that wins the swap reports the transition.
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        Some(Transition { from, to })
    }
}
