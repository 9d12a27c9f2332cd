//! Reconciliation subsystem.
//!
//! # Data Flow
//! ```text
//! TopologyPublisher::replace / remove
//!     → reconciler.rs (fragment table, debounce)
//!     → dynamic::merge
//!     → snapshot.rs (middlewares → pools → route table → chains)
//!     → SnapshotHandle::publish (single atomic swap)
//!
//! Request path:
//!     SnapshotHandle::load → Arc<RoutingSnapshot> held for the whole request
//! ```
//!
//! # Design Decisions
//! - One writer: only the reconciler publishes
//! - A cycle whose merged configuration is unchanged publishes nothing
//! - Entity errors never block publishing the rest of the topology

pub mod dump;
pub mod reconciler;
pub mod snapshot;

pub use dump::SnapshotDump;
pub use reconciler::{topology_channel, PublishError, Reconciler, TopologyPublisher};
pub use snapshot::{BuildContext, RoutingSnapshot, SnapshotHandle};
