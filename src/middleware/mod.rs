//! Router middlewares.
//!
//! # Data Flow
//! ```text
//! Snapshot build:
//!     DynamicConfig.middlewares
//!     → chain.rs (instantiate each kind once; carry persistent state over)
//!     → MiddlewareChain per router
//!
//! Request:
//!     chain.on_request (declared order; may short-circuit)
//!     → dispatcher forwards
//!     → chain.on_response (reverse order)
//! ```
//!
//! # Design Decisions
//! - Closed enum of kinds, resolved once per snapshot, no string lookups per request
//! - State (buckets, breakers) lives with the instance and dies with its snapshot
//!   unless the instance is persistent and its configuration unchanged
//! - Only forward_auth performs I/O

pub mod chain;
pub mod forward_auth;
pub mod rate_limit;
pub mod rewrite;

pub use chain::{
    CompiledMiddleware, Middleware, MiddlewareChain, MiddlewareSet, Passage, RequestContext,
    RetryPolicy,
};
