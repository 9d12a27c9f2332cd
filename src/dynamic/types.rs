//! Topology and dynamic configuration types.
//!
//! Fragment types are what providers publish; the `Resolved*` types are what the
//! merger produces after namespacing and reference resolution.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One provider's complete current view of routers, services and middlewares.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TopologyFragment {
    pub routers: BTreeMap<String, RouterConfig>,
    pub services: BTreeMap<String, ServiceConfig>,
    pub middlewares: BTreeMap<String, MiddlewareConfig>,
    /// Global names exported by this fragment.
    pub aliases: AliasConfig,
}

impl TopologyFragment {
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty() && self.services.is_empty() && self.middlewares.is_empty()
    }
}

/// Explicit opt-in to flat names usable from other sources.
///
/// Keys are the global alias, values the local entity name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AliasConfig {
    pub services: BTreeMap<String, String>,
    pub middlewares: BTreeMap<String, String>,
}

/// Event emitted by a provider adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    /// The source's fragment is replaced wholesale.
    Replaced {
        source: String,
        fragment: TopologyFragment,
    },
    /// The source is gone; everything it declared disappears.
    Removed { source: String },
}

impl TopologyEvent {
    pub fn source(&self) -> &str {
        match self {
            TopologyEvent::Replaced { source, .. } | TopologyEvent::Removed { source } => source,
        }
    }
}

/// Router definition as published by a provider.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Rule expression, e.g. ``Host(`a.test`) && PathPrefix(`/api`)``.
    pub rule: String,

    /// Target service reference.
    pub service: String,

    /// Ordered middleware references.
    #[serde(default)]
    pub middlewares: Vec<String>,

    /// Explicit priority; derived from the rule when absent.
    #[serde(default)]
    pub priority: Option<i64>,

    /// Whether this router is served over TLS.
    #[serde(default)]
    pub tls: bool,
}

/// Service definition: either a pool of servers or a weighted composite.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceConfig {
    LoadBalancer(LoadBalancerConfig),
    Weighted(WeightedConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub servers: Vec<ServerConfig>,

    /// Strategy name. Unknown names fall back to round-robin.
    pub strategy: Option<String>,

    pub sticky: Option<StickyConfig>,

    pub health_check: Option<ServiceHealthCheck>,

    /// Overrides the global fail-open policy.
    pub fail_open: Option<bool>,

    /// Forward the client's Host header instead of the target authority.
    pub pass_host_header: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Maximum concurrent requests to this server.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StickyConfig {
    #[serde(default = "default_sticky_cookie")]
    pub cookie: String,
}

fn default_sticky_cookie() -> String {
    "_edge_sticky".to_string()
}

/// Per-service overrides of the global health-check settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceHealthCheck {
    pub enabled: Option<bool>,
    pub kind: Option<ProbeKind>,
    pub path: Option<String>,
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    #[default]
    Http,
    Tcp,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WeightedConfig {
    pub services: Vec<WeightedService>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WeightedService {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Middleware definition. One variant per supported kind.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareConfig {
    Headers(HeadersConfig),
    StripPrefix(StripPrefixConfig),
    AddPrefix(AddPrefixConfig),
    RateLimit(RateLimitConfig),
    CircuitBreaker(CircuitBreakerConfig),
    Retry(RetryPolicyConfig),
    ForwardAuth(ForwardAuthConfig),
}

impl MiddlewareConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            MiddlewareConfig::Headers(_) => "headers",
            MiddlewareConfig::StripPrefix(_) => "strip_prefix",
            MiddlewareConfig::AddPrefix(_) => "add_prefix",
            MiddlewareConfig::RateLimit(_) => "rate_limit",
            MiddlewareConfig::CircuitBreaker(_) => "circuit_breaker",
            MiddlewareConfig::Retry(_) => "retry",
            MiddlewareConfig::ForwardAuth(_) => "forward_auth",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HeadersConfig {
    /// Headers set on the forwarded request. An empty value removes the header.
    pub request: BTreeMap<String, String>,
    /// Headers set on the response to the client.
    pub response: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StripPrefixConfig {
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AddPrefixConfig {
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained requests per second per client.
    pub average: u32,
    /// Bucket capacity.
    pub burst: u32,
    /// Keep buckets across reloads while the config is unchanged.
    pub persistent: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            average: 100,
            burst: 50,
            persistent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is let through.
    pub open_duration_ms: u64,
    /// Keep breaker state across reloads while the config is unchanged.
    pub persistent: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 10_000,
            persistent: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Extra attempts after the first one.
    pub attempts: u32,
    /// Base backoff between attempts.
    pub initial_interval_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            initial_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardAuthConfig {
    /// Authentication endpoint URL.
    pub address: String,
    /// Response headers copied from the auth server into the forwarded request.
    pub auth_response_headers: Vec<String>,
    pub timeout_ms: Option<u64>,
}

/// Router after namespacing; all references are qualified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedRouter {
    pub source: String,
    pub rule: String,
    pub service: String,
    pub middlewares: Vec<String>,
    pub priority: Option<i64>,
    pub tls: bool,
}

/// Service after namespacing; weighted children are qualified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedService {
    pub source: String,
    pub config: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedMiddleware {
    pub source: String,
    pub config: MiddlewareConfig,
}

/// The merged, canonical configuration across all sources.
///
/// Keys are qualified `name@source` identifiers. `BTreeMap` keeps the serialized
/// form independent of the order fragments arrived in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DynamicConfig {
    pub routers: BTreeMap<String, ResolvedRouter>,
    pub services: BTreeMap<String, ResolvedService>,
    pub middlewares: BTreeMap<String, ResolvedMiddleware>,
}

impl DynamicConfig {
    /// Canonical serialized form; equal configs produce equal bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Number of declared servers over all load-balancer services.
    pub fn target_count(&self) -> usize {
        self.services
            .values()
            .map(|s| match &s.config {
                ServiceConfig::LoadBalancer(lb) => lb.servers.len(),
                ServiceConfig::Weighted(_) => 0,
            })
            .sum()
    }
}

/// Which kind of entity a diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Source,
    Router,
    Service,
    Middleware,
    Alias,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Source => "source",
            EntityKind::Router => "router",
            EntityKind::Service => "service",
            EntityKind::Middleware => "middleware",
            EntityKind::Alias => "alias",
        };
        f.write_str(s)
    }
}

/// A per-entity configuration problem. Never fatal to a reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct EntityError {
    pub kind: EntityKind,
    pub entity: String,
    pub source: String,
    pub reason: String,
}

impl EntityError {
    pub fn new(
        kind: EntityKind,
        entity: impl Into<String>,
        source: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity: entity.into(),
            source: source.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for EntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (source {}): {}",
            self.kind, self.entity, self.source, self.reason
        )
    }
}
