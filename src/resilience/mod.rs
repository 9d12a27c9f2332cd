//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to target:
//!     → timeouts.rs (enforce per-attempt deadline)
//!     → On failure: retries.rs (check if retryable and within budget)
//!     → backoff.rs (delay before the next attempt)
//!     → circuit_breaker.rs (track failures, open circuit if threshold exceeded)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Retries only for idempotent requests (GET, HEAD, etc.)
//! - Circuit breaker prevents cascading failures

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use retries::{is_retryable, RetryBudget};
pub use timeouts::{with_deadline, DeadlineExceeded};
