//! Dynamic configuration subsystem.
//!
//! # Data Flow
//! ```text
//! Provider adapters (file, orchestrators, ...)
//!     → TopologyEvent::Replaced { source, fragment }
//!     → reconciler keeps the latest fragment per source
//!     → merge.rs (namespace, resolve references, drop invalid entities)
//!     → DynamicConfig + Vec<EntityError>
//! ```
//!
//! # Design Decisions
//! - Fragments are replaced wholesale, never patched
//! - Entity names are qualified as `name@source`
//! - Cross-source references only through `name@source` or exported aliases
//! - Errors are values scoped to one entity; merging never fails as a whole

pub mod merge;
pub mod naming;
pub mod types;

pub use merge::{merge, MergeOutcome};
pub use types::{
    DynamicConfig, EntityError, EntityKind, MiddlewareConfig, ServiceConfig, TopologyEvent,
    TopologyFragment,
};
