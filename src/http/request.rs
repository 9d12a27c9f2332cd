//! Request identifiers.
//!
//! # Responsibilities
//! - Generate a UUID v4 request ID when the client sent none
//! - Read the ID back for records and logs
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - A client-supplied ID is kept and forwarded unchanged

use axum::http::{HeaderMap, HeaderName, Request};
use tower_http::request_id::{MakeRequestId, RequestId};

pub const X_REQUEST_ID: &str = "x-request-id";

pub fn request_id_header() -> HeaderName {
    HeaderName::from_static(X_REQUEST_ID)
}

/// UUID v4 generator for `SetRequestIdLayer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::new_v4().to_string();
        id.parse().ok().map(RequestId::new)
    }
}

pub fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn generates_uuid_ids() {
        let req = Request::new(Body::empty());
        let id = MakeRequestUuid.make_request_id(&req).unwrap();
        let text = id.header_value().to_str().unwrap();
        assert!(uuid::Uuid::parse_str(text).is_ok());
    }
}
