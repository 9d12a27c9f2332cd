//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: testing if backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold
//! Open → Half-Open: after open duration
//! Half-Open → Closed: probe request succeeds
//! Half-Open → Open: probe request fails
//! ```
//!
//! # Design Decisions
//! - One breaker per middleware instance (not global)
//! - Fail fast in Open state (no waiting for timeout)
//! - Single probe in Half-Open (prevents hammering recovering backend)
//! - A probe dropped before its outcome is recorded frees the probe slot

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// Incremented for every probe handed out.
    probe_seq: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_duration,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                probe_seq: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Admit a request, or `None` when it must fail fast. In Half-Open only
    /// one probe passes; its admission must outlive the upstream call.
    pub fn admit(&self) -> Option<Admission<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission {
                breaker: self,
                probe: None,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("Circuit half-open, letting one probe through");
                    Some(self.start_probe(&mut inner))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    Some(self.start_probe(&mut inner))
                }
            }
        }
    }

    fn start_probe(&self, inner: &mut Inner) -> Admission<'_> {
        inner.probe_in_flight = true;
        inner.probe_seq += 1;
        Admission {
            breaker: self,
            probe: Some(inner.probe_seq),
        }
    }

    /// The probe `seq` ended without an outcome.
    fn abandon_probe(&self, seq: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight && inner.probe_seq == seq {
            tracing::debug!("Half-open probe abandoned, next request probes");
            inner.probe_in_flight = false;
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            tracing::info!("Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            tracing::warn!(failures = inner.consecutive_failures, "Circuit opened");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
        }
    }
}

/// A request let through by a breaker. Dropping the admission of a
/// half-open probe before an outcome is recorded frees the probe slot.
#[derive(Debug)]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: Option<u64>,
}

impl Admission<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let Some(seq) = self.probe {
            self.breaker.abandon_probe(seq);
        }
    }
}
