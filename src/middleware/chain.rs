//! Compiled middlewares, the per-snapshot set, and per-router chains.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{Response, StatusCode};

use crate::dynamic::types::{DynamicConfig, EntityError, EntityKind, MiddlewareConfig};
use crate::http::client::HttpClient;
use crate::middleware::forward_auth::ForwardAuth;
use crate::middleware::rate_limit::RateLimiter;
use crate::middleware::rewrite::{AddPrefix, HeaderRewrite, StripPrefix};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{Admission, CircuitBreaker};
use crate::resilience::retries::MAX_EXTRA_ATTEMPTS;

/// Retry settings carried by a router's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first, already capped.
    pub attempts: u32,
    pub initial_interval: Duration,
}

/// The closed set of middleware behaviors.
#[derive(Debug)]
pub enum Middleware {
    Headers(HeaderRewrite),
    StripPrefix(StripPrefix),
    AddPrefix(AddPrefix),
    RateLimit(RateLimiter),
    CircuitBreaker(CircuitBreaker),
    Retry(RetryPolicy),
    ForwardAuth(ForwardAuth),
}

impl Middleware {
    pub fn compile(config: &MiddlewareConfig) -> Result<Self, String> {
        let m = match config {
            MiddlewareConfig::Headers(c) => {
                Middleware::Headers(HeaderRewrite::compile(c).map_err(|e| e.to_string())?)
            }
            MiddlewareConfig::StripPrefix(c) => {
                Middleware::StripPrefix(StripPrefix::new(&c.prefixes).map_err(|e| e.to_string())?)
            }
            MiddlewareConfig::AddPrefix(c) => {
                Middleware::AddPrefix(AddPrefix::new(&c.prefix).map_err(|e| e.to_string())?)
            }
            MiddlewareConfig::RateLimit(c) => Middleware::RateLimit(RateLimiter::new(c)),
            MiddlewareConfig::CircuitBreaker(c) => Middleware::CircuitBreaker(CircuitBreaker::new(
                c.failure_threshold,
                Duration::from_millis(c.open_duration_ms),
            )),
            MiddlewareConfig::Retry(c) => Middleware::Retry(RetryPolicy {
                attempts: c.attempts.min(MAX_EXTRA_ATTEMPTS),
                initial_interval: Duration::from_millis(c.initial_interval_ms),
            }),
            MiddlewareConfig::ForwardAuth(c) => {
                Middleware::ForwardAuth(ForwardAuth::new(c).map_err(|e| e.to_string())?)
            }
        };
        Ok(m)
    }
}

/// A middleware instance with the configuration it was built from.
#[derive(Debug)]
pub struct CompiledMiddleware {
    pub name: String,
    pub source: String,
    pub config: MiddlewareConfig,
    pub behavior: Middleware,
}

impl CompiledMiddleware {
    fn persistent(&self) -> bool {
        match &self.config {
            MiddlewareConfig::RateLimit(c) => c.persistent,
            MiddlewareConfig::CircuitBreaker(c) => c.persistent,
            _ => false,
        }
    }
}

/// Per-request inputs middlewares may need.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub client_addr: SocketAddr,
    pub client: &'a HttpClient,
}

/// Every middleware instance of one snapshot.
#[derive(Debug, Default)]
pub struct MiddlewareSet {
    entries: BTreeMap<String, Arc<CompiledMiddleware>>,
}

impl MiddlewareSet {
    /// Instantiate every middleware. Stateful instances marked persistent
    /// are carried over from `previous` when their configuration is unchanged.
    pub fn build(config: &DynamicConfig, previous: &MiddlewareSet) -> (Self, Vec<EntityError>) {
        let mut entries = BTreeMap::new();
        let mut errors = Vec::new();

        for (name, resolved) in &config.middlewares {
            if let Some(old) = previous.entries.get(name) {
                if old.persistent() && old.config == resolved.config {
                    entries.insert(name.clone(), old.clone());
                    continue;
                }
            }
            match Middleware::compile(&resolved.config) {
                Ok(behavior) => {
                    entries.insert(
                        name.clone(),
                        Arc::new(CompiledMiddleware {
                            name: name.clone(),
                            source: resolved.source.clone(),
                            config: resolved.config.clone(),
                            behavior,
                        }),
                    );
                }
                Err(reason) => {
                    tracing::warn!(middleware = %name, kind = resolved.config.kind(), reason = %reason, "Excluding middleware");
                    errors.push(EntityError::new(
                        EntityKind::Middleware,
                        name,
                        &resolved.source,
                        format!("cannot instantiate {}: {}", resolved.config.kind(), reason),
                    ));
                }
            }
        }

        (Self { entries }, errors)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CompiledMiddleware>> {
        self.entries.get(name)
    }

    /// Chain for the given names; the first missing name is returned as error.
    pub fn chain(&self, names: &[String]) -> Result<MiddlewareChain, String> {
        let items = names
            .iter()
            .map(|n| self.entries.get(n).cloned().ok_or_else(|| n.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MiddlewareChain { items })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<CompiledMiddleware>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Middlewares of one router, in declared order.
#[derive(Debug, Default, Clone)]
pub struct MiddlewareChain {
    items: Vec<Arc<CompiledMiddleware>>,
}

/// How far a request got through the request phase. Holds circuit breaker
/// admissions until the response phase settles them.
#[derive(Debug)]
pub struct Passage<'a> {
    passed: usize,
    admissions: Vec<Admission<'a>>,
}

impl Passage<'_> {
    /// Number of middlewares that passed the request on.
    pub fn passed(&self) -> usize {
        self.passed
    }
}

impl MiddlewareChain {
    /// Run the request phase. Returns the passage through the chain, and the
    /// short-circuit response if one answered.
    pub async fn on_request(
        &self,
        parts: &mut Parts,
        ctx: &RequestContext<'_>,
    ) -> (Passage<'_>, Option<Response<Body>>) {
        let mut admissions = Vec::new();
        for (idx, item) in self.items.iter().enumerate() {
            let answer = match &item.behavior {
                Middleware::Headers(h) => {
                    h.apply_request(&mut parts.headers);
                    None
                }
                Middleware::StripPrefix(s) => {
                    s.apply(parts);
                    None
                }
                Middleware::AddPrefix(a) => {
                    a.apply(parts);
                    None
                }
                Middleware::RateLimit(limiter) => {
                    if limiter.check(ctx.client_addr.ip()) {
                        None
                    } else {
                        tracing::debug!(middleware = %item.name, client = %ctx.client_addr.ip(), "Rate limit exceeded");
                        metrics::record_rate_limited(&item.name);
                        Some(plain(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"))
                    }
                }
                Middleware::CircuitBreaker(breaker) => match breaker.admit() {
                    Some(admission) => {
                        admissions.push(admission);
                        None
                    }
                    None => Some(plain(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")),
                },
                Middleware::Retry(_) => None,
                Middleware::ForwardAuth(auth) => auth.check(parts, ctx.client).await.err(),
            };
            if let Some(response) = answer {
                return (
                    Passage {
                        passed: idx,
                        admissions,
                    },
                    Some(response),
                );
            }
        }
        (
            Passage {
                passed: self.items.len(),
                admissions,
            },
            None,
        )
    }

    /// Run the response phase in reverse over the middlewares the request passed.
    pub fn on_response(&self, passage: Passage<'_>, response: &mut Response<Body>) {
        let failed = response.status().is_server_error();
        for item in self.items[..passage.passed.min(self.items.len())].iter().rev() {
            match &item.behavior {
                Middleware::Headers(h) => h.apply_response(response.headers_mut()),
                Middleware::CircuitBreaker(breaker) => {
                    if failed {
                        breaker.record_failure();
                    } else {
                        breaker.record_success();
                    }
                }
                _ => {}
            }
        }
    }

    /// Retry settings of the last retry middleware in the chain.
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.items.iter().rev().find_map(|m| match &m.behavior {
            Middleware::Retry(policy) => Some(*policy),
            _ => None,
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
