//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Certificates → first reconciliation → background tasks → admin → proxy listener
//!
//! Shutdown (shutdown.rs):
//!     Trigger → listeners stop accepting and drain
//!             → reconciler and health monitor exit their loops
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: remaining tasks are abandoned after the deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{run, start, RunningProxy, StartupError};
