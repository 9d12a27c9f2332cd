//! Configuration schema definitions.
//!
//! This module defines the static configuration structure for the proxy.
//! Routing topology is not part of it: routers, services and middlewares
//! arrive as fragments from providers (see `crate::dynamic`).
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::dynamic::types::ProbeKind;

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Topology providers.
    pub providers: ProvidersConfig,

    /// Reconciliation loop settings.
    pub reconcile: ReconcileConfig,

    /// Request dispatch policy.
    pub dispatch: DispatchConfig,

    /// Default health check settings, overridable per service.
    pub health_check: HealthCheckConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,

    pub security: SecurityConfig,

    /// Certificates served by SNI name.
    pub certificates: Vec<CertificateConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Topology providers.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    /// File providers: each file is one source's fragment.
    pub files: Vec<FileProviderConfig>,
}

/// A fragment file watched on disk.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileProviderConfig {
    /// Source name used to namespace every entity of the file.
    pub name: String,

    /// Path to the fragment (TOML, or JSON with a `.json` extension).
    pub path: String,

    /// Reload the fragment when the file changes.
    #[serde(default = "default_true")]
    pub watch: bool,
}

fn default_true() -> bool {
    true
}

/// Reconciliation loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Window in which bursts of topology events are coalesced.
    pub debounce_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

/// Request dispatch policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Serve from unhealthy targets when a pool has no routable ones.
    pub fail_open: bool,

    /// Status returned when no router matches.
    pub no_route_status: u16,

    /// Body returned when no router matches.
    pub no_route_body: String,

    /// Largest request body buffered so that it can be replayed on retry.
    pub max_retry_body_bytes: usize,

    /// Default per-target concurrency limit.
    pub max_connections_per_target: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            no_route_status: 404,
            no_route_body: "404 page not found".to_string(),
            max_retry_body_bytes: 64 * 1024,
            max_connections_per_target: 1024,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Probe kind when a service does not specify one.
    pub kind: ProbeKind,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,

    /// Feed request outcomes into target health.
    pub passive: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProbeKind::Http,
            interval_secs: 10,
            timeout_secs: 5,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            passive: true,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Per-attempt deadline for a forwarded request, in seconds.
    pub request_secs: u64,

    /// Idle connection timeout in seconds.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
            idle_secs: 60,
        }
    }
}

/// Retry configuration.
///
/// Retries only happen on routers carrying a `retry` middleware; these
/// settings bound them globally.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Percentage of requests that can be retries (retry budget).
    /// e.g., 0.1 for 10% budget.
    pub budget_ratio: f32,

    /// Retries always allowed regardless of the ratio.
    pub min_retries: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 25,
            max_delay_ms: 1000,
            budget_ratio: 0.2,
            min_retries: 10,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Security hardening configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum body size in bytes.
    pub max_body_size: usize,

    /// Add X-Forwarded-* headers to forwarded requests.
    pub forwarded_headers: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
            forwarded_headers: true,
        }
    }
}

/// A certificate served for one or more SNI names.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateConfig {
    /// Exact names or `*.` wildcards.
    pub domains: Vec<String>,

    pub cert_path: String,

    pub key_path: String,
}
