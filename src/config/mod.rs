//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! Static config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!
//! Fragment files (TOML or JSON), one per source:
//!     → watcher.rs (FileProvider: load, watch)
//!     → TopologyPublisher::replace / remove
//!     → reconciler
//! ```
//!
//! # Design Decisions
//! - Static config is immutable once loaded; changes require a restart
//! - Routing topology is dynamic and never part of the static file
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, load_fragment, ConfigError};
pub use schema::{HealthCheckConfig, ListenerConfig, ProxyConfig};
pub use validation::{validate_config, ValidationError};
pub use watcher::FileProvider;
