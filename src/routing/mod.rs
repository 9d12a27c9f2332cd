//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path, method, headers, query)
//!     → matcher.rs (RequestInfo view, rule evaluation)
//!     → router.rs (indexed route lookup)
//!     → Return: matched CompiledRoute or NoMatch
//!
//! Route Compilation (every reconciliation):
//!     ResolvedRouter[]
//!     → rule.rs (parse expression, derive priority)
//!     → Sort by (priority, literal length, configuration order)
//!     → Index by exact host
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Route tables are rebuilt wholesale, never mutated after compile
//! - No regex in hot path
//! - Deterministic: same input always matches same route
//! - First match wins (ordered by precedence)

pub mod matcher;
pub mod router;
pub mod rule;

pub use matcher::{Matcher, RequestInfo};
pub use router::{CompiledRoute, RouteTable};
pub use rule::{Rule, RuleError};
