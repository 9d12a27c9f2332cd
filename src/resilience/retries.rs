//! Retry logic.
//!
//! # Responsibilities
//! - Determine if an attempt is retryable (idempotent methods only)
//! - Enforce retry budget (retries as a share of recent requests)
//!
//! # Design Decisions
//! - Never retry POST/PATCH (non-idempotent)
//! - Only failures that point at the target are retried
//! - Retry budget prevents retry storms under load
//! - Each retry goes to a different target; the dispatcher enforces that

use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::Method;

use crate::health::passive::Outcome;

/// Hard cap on extra attempts per request.
pub const MAX_EXTRA_ATTEMPTS: u32 = 2;

pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}

/// Whether an attempt with this outcome may be repeated elsewhere.
pub fn is_retryable(method: &Method, outcome: &Outcome) -> bool {
    is_idempotent(method) && outcome.is_failure()
}

#[derive(Debug)]
struct Window {
    started: Instant,
    requests: u64,
    retries: u64,
}

/// Allows retries while `retries <= max(min_retries, requests * ratio)`
/// within a sliding-by-reset window.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f32,
    min_retries: u64,
    period: Duration,
    window: Mutex<Window>,
}

impl RetryBudget {
    pub fn new(ratio: f32, min_retries: u64) -> Self {
        Self::with_period(ratio, min_retries, Duration::from_secs(10))
    }

    pub fn with_period(ratio: f32, min_retries: u64, period: Duration) -> Self {
        Self {
            ratio: ratio.max(0.0),
            min_retries,
            period,
            window: Mutex::new(Window {
                started: Instant::now(),
                requests: 0,
                retries: 0,
            }),
        }
    }

    fn with_window<T>(&self, f: impl FnOnce(&mut Window) -> T) -> T {
        let mut window = match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if window.started.elapsed() >= self.period {
            *window = Window {
                started: Instant::now(),
                requests: 0,
                retries: 0,
            };
        }
        f(&mut *window)
    }

    pub fn record_request(&self) {
        self.with_window(|w| w.requests += 1);
    }

    /// Reserve one retry if the budget allows it.
    pub fn try_acquire(&self) -> bool {
        let ratio = f64::from(self.ratio);
        let min_retries = self.min_retries;
        self.with_window(|w| {
            let allowed = ((w.requests as f64) * ratio) as u64;
            if w.retries < allowed.max(min_retries) {
                w.retries += 1;
                true
            } else {
                false
            }
        })
    }
}
