//! Request dispatch against one routing snapshot.
//!
//! # Responsibilities
//! - Match the request to a router and run its middleware chain
//! - Select a target, forward, and retry on a different target when allowed
//! - Report outcomes to passive health checking and observability
//!
//! # Design Decisions
//! - The snapshot is passed in and held for the whole request
//! - A body is buffered only when a retry could replay it
//! - The in-flight slot on a target is held until the response body ends

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, Request, Response, StatusCode, Uri};
use futures_util::StreamExt;

use crate::config::schema::ProxyConfig;
use crate::health::passive::{self, Outcome};
use crate::http::client::HttpClient;
use crate::http::request::request_id;
use crate::http::response::{plain_text, DispatchError};
use crate::load_balancer::backend::{Backend, BackendConnectionGuard};
use crate::load_balancer::pool::{SelectRequest, Selected};
use crate::middleware::{MiddlewareChain, RequestContext};
use crate::observability::metrics;
use crate::observability::records::RequestRecord;
use crate::reconcile::RoutingSnapshot;
use crate::resilience::backoff::retry_delay;
use crate::resilience::retries::{is_idempotent, is_retryable, RetryBudget};
use crate::resilience::timeouts::with_deadline;
use crate::routing::RequestInfo;
use crate::security::headers::{add_forwarded, strip_hop_by_hop};

/// Static dispatch settings taken from `ProxyConfig`.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub no_route_status: StatusCode,
    pub no_route_body: String,
    pub max_retry_body_bytes: usize,
    pub request_timeout: Duration,
    pub passive_health: bool,
    pub forwarded_headers: bool,
    pub max_backoff: Duration,
}

impl DispatchPolicy {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            no_route_status: StatusCode::from_u16(config.dispatch.no_route_status)
                .unwrap_or(StatusCode::NOT_FOUND),
            no_route_body: config.dispatch.no_route_body.clone(),
            max_retry_body_bytes: config.dispatch.max_retry_body_bytes,
            request_timeout: Duration::from_secs(config.timeouts.request_secs),
            passive_health: config.health_check.passive,
            forwarded_headers: config.security.forwarded_headers,
            max_backoff: Duration::from_millis(config.retries.max_delay_ms),
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Forwarded request body.
enum Payload {
    /// Replayable across attempts.
    Buffered(Bytes),
    /// Single use.
    Streaming(Option<Body>),
}

impl Payload {
    fn take(&mut self) -> Body {
        match self {
            Payload::Buffered(bytes) => Body::from(bytes.clone()),
            Payload::Streaming(body) => body.take().unwrap_or_else(Body::empty),
        }
    }

    fn replayable(&self) -> bool {
        matches!(self, Payload::Buffered(_))
    }
}

/// Result of one forwarded attempt.
struct Attempt {
    outcome: Outcome,
    result: Result<Response<Body>, DispatchError>,
}

pub struct Dispatcher {
    client: HttpClient,
    policy: DispatchPolicy,
    retry_budget: RetryBudget,
}

impl Dispatcher {
    pub fn new(client: HttpClient, policy: DispatchPolicy, retry_budget: RetryBudget) -> Self {
        Self {
            client,
            policy,
            retry_budget,
        }
    }

    pub fn from_config(config: &ProxyConfig, client: HttpClient) -> Self {
        Self::new(
            client,
            DispatchPolicy::from_config(config),
            RetryBudget::new(config.retries.budget_ratio, config.retries.min_retries),
        )
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Serve one request entirely from `snapshot`.
    pub async fn dispatch(
        &self,
        snapshot: Arc<RoutingSnapshot>,
        request: Request<Body>,
        client_addr: SocketAddr,
        tls: bool,
    ) -> Response<Body> {
        let started = Instant::now();
        let (mut parts, body) = request.into_parts();
        let mut record = RequestRecord {
            request_id: request_id(&parts.headers),
            router: None,
            service: None,
            target: None,
            status: 0,
            latency: Duration::ZERO,
            attempts: 0,
            error_kind: None,
        };

        let route = snapshot
            .routes
            .match_request(&RequestInfo::from_parts(&parts))
            .cloned();
        let Some(route) = route else {
            tracing::debug!(
                host = ?parts.headers.get(header::HOST),
                path = %parts.uri.path(),
                generation = snapshot.generation,
                "No router matched"
            );
            let response = plain_text(self.policy.no_route_status, self.policy.no_route_body.clone());
            record.error_kind = Some(DispatchError::NoRoute.kind());
            return finish(record, started, response);
        };
        record.router = Some(route.name.clone());
        record.service = Some(route.service.clone());

        let empty = MiddlewareChain::default();
        let chain = snapshot.chain(&route.name).unwrap_or(&empty);
        let ctx = RequestContext {
            client_addr,
            client: &self.client,
        };

        let (passage, answer) = chain.on_request(&mut parts, &ctx).await;
        if let Some(mut response) = answer {
            chain.on_response(passage, &mut response);
            record.error_kind = Some("middleware");
            return finish(record, started, response);
        }

        let policy = chain.retry_policy().filter(|_| is_idempotent(&parts.method));
        let mut payload = match self.payload(&parts, body, policy.is_some()).await {
            Ok(payload) => payload,
            Err(e) => {
                record.error_kind = Some(e.kind());
                let mut response = axum::response::IntoResponse::into_response(e);
                chain.on_response(passage, &mut response);
                return finish(record, started, response);
            }
        };
        let extra_attempts = match policy {
            Some(p) if payload.replayable() => p.attempts,
            _ => 0,
        };

        self.retry_budget.record_request();
        let mut tried: Vec<Arc<Backend>> = Vec::new();
        let mut last: Option<Attempt> = None;

        let mut response = loop {
            let select = SelectRequest {
                headers: &parts.headers,
                exclude: &tried,
            };
            let selected = match snapshot.pools.select(&route.service, &select) {
                Ok(selected) => selected,
                Err(e) => match last.take() {
                    // No other target left for a retry: report the last attempt.
                    Some(previous) => break previous.result,
                    None => break Err(DispatchError::from(e)),
                },
            };

            record.attempts += 1;
            record.service = Some(selected.service.clone());
            record.target = Some(selected.backend().authority.clone());
            if selected.failed_open {
                tracing::debug!(service = %selected.service, target = %selected.backend().authority, "Routing to unhealthy target (fail-open)");
            }
            tried.push(selected.backend().clone());

            let body = payload.take();
            let attempt = self.forward(&parts, selected, body, client_addr, tls).await;

            let may_retry = record.attempts <= extra_attempts
                && is_retryable(&parts.method, &attempt.outcome)
                && self.retry_budget.try_acquire();
            if !may_retry {
                break attempt.result;
            }

            let service = record.service.as_deref().unwrap_or_default();
            metrics::record_retry(service);
            let base = policy.map(|p| p.initial_interval).unwrap_or_default();
            let delay = retry_delay(record.attempts, base, self.policy.max_backoff);
            tracing::debug!(
                router = %route.name,
                service = %service,
                attempt = record.attempts,
                outcome = ?attempt.outcome,
                delay_ms = delay.as_millis() as u64,
                "Retrying on another target"
            );
            last = Some(attempt);
            tokio::time::sleep(delay).await;
        }
        .unwrap_or_else(|e| {
            record.error_kind = Some(e.kind());
            axum::response::IntoResponse::into_response(e)
        });

        chain.on_response(passage, &mut response);
        finish(record, started, response)
    }

    async fn payload(&self, parts: &Parts, body: Body, replay: bool) -> Result<Payload, DispatchError> {
        if !replay {
            return Ok(Payload::Streaming(Some(body)));
        }
        // Only bodies of known, bounded size are buffered.
        let length = match parts.headers.get(header::CONTENT_LENGTH) {
            Some(v) => v.to_str().ok().and_then(|v| v.parse::<usize>().ok()),
            None if parts.headers.contains_key(header::TRANSFER_ENCODING) => None,
            None => Some(0),
        };
        match length {
            Some(len) if len <= self.policy.max_retry_body_bytes => {
                let bytes = axum::body::to_bytes(body, self.policy.max_retry_body_bytes)
                    .await
                    .map_err(|e| DispatchError::Body(e.to_string()))?;
                Ok(Payload::Buffered(bytes))
            }
            _ => Ok(Payload::Streaming(Some(body))),
        }
    }

    async fn forward(
        &self,
        parts: &Parts,
        selected: Selected,
        body: Body,
        client_addr: SocketAddr,
        tls: bool,
    ) -> Attempt {
        let Selected {
            guard,
            service,
            set_cookie,
            pass_host_header,
            probe,
            ..
        } = selected;

        let request = match upstream_request(parts, &guard.backend, body, pass_host_header, self.policy.forwarded_headers, client_addr, tls) {
            Ok(request) => request,
            Err(e) => {
                return Attempt {
                    outcome: Outcome::ConnectError,
                    result: Err(e),
                }
            }
        };

        let (outcome, result) = match with_deadline(self.policy.request_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => (Outcome::Response(response.status()), Ok(response)),
            Ok(Err(e)) => {
                tracing::warn!(service = %service, target = %guard.backend.authority, error = %e, "Upstream request failed");
                (Outcome::ConnectError, Err(DispatchError::Upstream(e.to_string())))
            }
            Err(e) => {
                tracing::warn!(service = %service, target = %guard.backend.authority, timeout_ms = e.0.as_millis() as u64, "Upstream request timed out");
                (Outcome::Timeout, Err(DispatchError::Timeout(e.0)))
            }
        };

        if self.policy.passive_health {
            passive::observe(&service, &guard.backend, outcome, probe.thresholds);
        }

        let result = result.map(|response: Response<hyper::body::Incoming>| {
            let (mut head, incoming) = response.into_parts();
            strip_hop_by_hop(&mut head.headers);
            if let Some(cookie) = set_cookie {
                head.headers.append(header::SET_COOKIE, cookie);
            }
            Response::from_parts(head, hold_until_end(Body::new(incoming), guard))
        });
        Attempt { outcome, result }
    }
}

/// Build the request sent to `backend`.
fn upstream_request(
    parts: &Parts,
    backend: &Backend,
    body: Body,
    pass_host_header: bool,
    forwarded_headers: bool,
    client_addr: SocketAddr,
    tls: bool,
) -> Result<Request<Body>, DispatchError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("http://{}{}", backend.authority, path_and_query)
        .parse()
        .map_err(|e: axum::http::uri::InvalidUri| DispatchError::InvalidRequest(e.to_string()))?;

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    if forwarded_headers {
        add_forwarded(&mut headers, client_addr.ip(), tls);
    }
    if !pass_host_header || !headers.contains_key(header::HOST) {
        let host = HeaderValue::from_str(&backend.authority)
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        headers.insert(header::HOST, host);
    }

    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(body)
        .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Keep the target's in-flight slot until the body is fully sent or dropped.
fn hold_until_end(body: Body, guard: BackendConnectionGuard) -> Body {
    let stream = body.into_data_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });
    Body::from_stream(stream)
}

fn finish(mut record: RequestRecord, started: Instant, response: Response<Body>) -> Response<Body> {
    record.status = response.status().as_u16();
    record.latency = started.elapsed();
    record.emit();
    response
}
