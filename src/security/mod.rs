//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarded request:
//!     → headers.rs (strip hop-by-hop, add X-Forwarded-*)
//!     → Pass to target
//!
//! Target response:
//!     → headers.rs (strip hop-by-hop)
//!     → Pass to client
//! ```
//!
//! Body size limits are enforced by the server's tower layers; per-client
//! rate limiting is a router middleware (`crate::middleware::rate_limit`).

pub mod headers;
