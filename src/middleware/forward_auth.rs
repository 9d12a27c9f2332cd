//! Delegated authentication.
//!
//! The original request headers are sent with a GET to the auth address,
//! together with `X-Forwarded-Method/-Host/-Uri`. A 2xx answer lets the
//! request through and copies the configured headers into it; any other
//! answer is returned to the client as is.

use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderName};
use axum::http::request::Parts;
use axum::http::{Request, Response, StatusCode, Uri};

use crate::dynamic::types::ForwardAuthConfig;
use crate::http::client::HttpClient;
use crate::resilience::timeouts::with_deadline;
use crate::security::headers::is_hop_by_hop;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ForwardAuthError {
    #[error("invalid auth address `{0}`")]
    Address(String),
    #[error("invalid auth response header `{0}`")]
    HeaderName(String),
}

#[derive(Debug)]
pub struct ForwardAuth {
    address: Uri,
    copy_headers: Vec<HeaderName>,
    timeout: Duration,
}

impl ForwardAuth {
    pub fn new(config: &ForwardAuthConfig) -> Result<Self, ForwardAuthError> {
        let address: Uri = config
            .address
            .parse()
            .map_err(|_| ForwardAuthError::Address(config.address.clone()))?;
        if address.scheme_str() != Some("http") || address.authority().is_none() {
            return Err(ForwardAuthError::Address(config.address.clone()));
        }
        let copy_headers = config
            .auth_response_headers
            .iter()
            .map(|h| {
                HeaderName::from_bytes(h.as_bytes())
                    .map_err(|_| ForwardAuthError::HeaderName(h.clone()))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            address,
            copy_headers,
            timeout: config
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TIMEOUT),
        })
    }

    /// `Ok(())` lets the request continue; `Err` is the response to send.
    pub async fn check(&self, parts: &mut Parts, client: &HttpClient) -> Result<(), Response<Body>> {
        let mut builder = Request::builder().method("GET").uri(self.address.clone());
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in parts.headers.iter() {
                if name != header::HOST && name != header::CONTENT_LENGTH && !is_hop_by_hop(name) {
                    headers.append(name.clone(), value.clone());
                }
            }
            if let Ok(v) = parts.method.as_str().parse() {
                headers.insert("x-forwarded-method", v);
            }
            if let Some(host) = parts.headers.get(header::HOST) {
                headers.insert("x-forwarded-host", host.clone());
            }
            let uri = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            if let Ok(v) = uri.parse() {
                headers.insert("x-forwarded-uri", v);
            }
        }
        let request = match builder.body(Body::empty()) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build auth request");
                return Err(error_response());
            }
        };

        let response = match with_deadline(self.timeout, client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(address = %self.address, error = %e, "Auth server unreachable");
                return Err(error_response());
            }
            Err(e) => {
                tracing::warn!(address = %self.address, error = %e, "Auth server timed out");
                return Err(error_response());
            }
        };

        if response.status().is_success() {
            for name in &self.copy_headers {
                parts.headers.remove(name);
                for value in response.headers().get_all(name) {
                    parts.headers.append(name.clone(), value.clone());
                }
            }
            return Ok(());
        }

        tracing::debug!(address = %self.address, status = %response.status(), "Auth server denied request");
        let (resp_parts, body) = response.into_parts();
        Err(Response::from_parts(resp_parts, Body::new(body)))
    }
}

fn error_response() -> Response<Body> {
    let mut response = Response::new(Body::from("authentication service unavailable"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
