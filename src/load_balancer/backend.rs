//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single target endpoint of a service
//! - Track active requests (for Least Connections LB)
//! - Enforce max connection limits
//! - Carry the target's health state (mutated by health checks only)

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use url::Url;

use crate::health::state::{HealthState, TargetHealth};

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    /// Target URL as configured.
    pub url: Url,
    /// `host:port` used for URI rewriting, probes, and logs.
    pub authority: String,
    /// Weight for weighted selection.
    pub weight: u32,
    /// Maximum concurrent requests allowed.
    pub max_connections: usize,
    /// Number of currently active requests.
    pub active_connections: AtomicUsize,
    /// Health state, shared with the health checker.
    pub health: TargetHealth,
}

/// Reasons a target URL is rejected.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid target url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported scheme `{0}`, only http is forwarded")]
    UnsupportedScheme(String),
    #[error("target url `{0}` has no host")]
    MissingHost(String),
}

impl Backend {
    /// Create a new backend from a parsed URL.
    pub fn new(url: Url, weight: u32, max_connections: usize) -> Result<Self, BackendError> {
        if url.scheme() != "http" {
            return Err(BackendError::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| BackendError::MissingHost(url.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let authority = format!("{}:{}", host, port);

        Ok(Self {
            url,
            authority,
            weight,
            max_connections,
            active_connections: AtomicUsize::new(0),
            health: TargetHealth::new(),
        })
    }

    /// Parse and create a backend.
    pub fn parse(raw: &str, weight: u32, max_connections: usize) -> Result<Self, BackendError> {
        let url = Url::parse(raw).map_err(|source| BackendError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;
        Self::new(url, weight, max_connections)
    }

    /// Whether `other` describes the same target with the same settings.
    pub fn same_target(&self, url: &str, weight: u32, max_connections: usize) -> bool {
        Url::parse(url).map(|u| u == self.url).unwrap_or(false)
            && self.weight == weight
            && self.max_connections == max_connections
    }

    /// Get the current number of active requests.
    pub fn active_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Increment active connection count.
    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connection count.
    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Try to create a connection guard that increments count.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<BackendConnectionGuard> {
        let mut prev = self.active_connections.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_connections {
                return None;
            }
            match self.active_connections.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(BackendConnectionGuard {
            backend: self.clone(),
        })
    }

    /// Healthy or not yet probed.
    pub fn is_healthy(&self) -> bool {
        self.health.is_routable()
    }

    pub fn health_state(&self) -> HealthState {
        self.health.state()
    }

    /// Stable fingerprint of the target, used as sticky cookie value.
    pub fn fingerprint(&self) -> String {
        format!("{:016x}", fnv1a(self.url.as_str().as_bytes()))
    }
}

/// 64-bit FNV-1a. Stable across processes and releases, unlike `DefaultHasher`.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    pub backend: Arc<Backend>,
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.dec_connections();
    }
}
