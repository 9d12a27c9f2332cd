//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Load current snapshot
//!     → Probe each due target (HTTP or TCP)
//!     → Update state.rs
//!
//! Passive health checks (passive.rs):
//!     Request outcome observed by the dispatcher
//!     → Classify success/failure
//!     → Update state.rs
//!
//! State machine (state.rs):
//!     Unknown → Healthy ←→ Unhealthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary
//! - State transitions require consecutive successes/failures
//! - Health state is per-target, not per-pool, and the only state mutated
//!   outside snapshot replacement

pub mod active;
pub mod passive;
pub mod state;

pub use active::{HealthMonitor, ProbeSettings};
pub use state::{HealthState, TargetHealth, Thresholds};
