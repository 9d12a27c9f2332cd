//! Edge reverse proxy with dynamic, multi-source routing configuration.
//!
//! Providers publish topology fragments; the reconciler merges them, compiles
//! a routing snapshot and swaps it in atomically. Requests are served from
//! whichever snapshot was current when they arrived.

pub mod admin;
pub mod config;
pub mod dynamic;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod middleware;
pub mod net;
pub mod observability;
pub mod reconcile;
pub mod resilience;
pub mod routing;
pub mod security;

pub use config::schema::ProxyConfig;
pub use dynamic::{DynamicConfig, TopologyEvent, TopologyFragment};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use reconcile::{Reconciler, RoutingSnapshot, SnapshotHandle, TopologyPublisher};
