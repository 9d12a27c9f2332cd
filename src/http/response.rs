//! Dispatch errors and the responses clients see for them.
//!
//! # Design Decisions
//! - Every failure maps to a status class; nothing escapes as a fault
//! - Bodies are short plain text, never upstream error detail

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;

use crate::load_balancer::SelectError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no router matched")]
    NoRoute,
    #[error(transparent)]
    NoTarget(#[from] SelectError),
    #[error("target did not answer within {0:?}")]
    Timeout(Duration),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
    #[error("failed to read request body: {0}")]
    Body(String),
}

impl DispatchError {
    /// Short label used in request records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::NoRoute => "no_route",
            DispatchError::NoTarget(SelectError::Saturated(_)) => "saturated",
            DispatchError::NoTarget(_) => "no_healthy_target",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Upstream(_) => "upstream",
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::Body(_) => "body",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::NoRoute => StatusCode::NOT_FOUND,
            DispatchError::NoTarget(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Upstream(_) | DispatchError::InvalidRequest(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Body(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Error");
        plain_text(status, reason.to_string())
    }
}

/// A `text/plain` response.
pub fn plain_text(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
