//! Route matching logic.
//!
//! # Responsibilities
//! - Extract the routing-relevant view of a request once
//! - Evaluate parsed rules against that view
//!
//! # Design Decisions
//! - Host matching is case-insensitive and ignores the port
//! - Path matching is case-sensitive
//! - No regex to keep evaluation linear in the rule size

use axum::http::{request::Parts, HeaderMap, Method, Request};

use crate::routing::rule::Rule;

/// Routing-relevant view of a request.
#[derive(Debug, Clone)]
pub struct RequestInfo<'a> {
    pub host: String,
    pub path: &'a str,
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    pub query: Option<&'a str>,
}

impl<'a> RequestInfo<'a> {
    pub fn from_parts(parts: &'a Parts) -> Self {
        Self::build(&parts.uri, &parts.method, &parts.headers)
    }

    pub fn from_request<B>(req: &'a Request<B>) -> Self {
        Self::build(req.uri(), req.method(), req.headers())
    }

    fn build(uri: &'a axum::http::Uri, method: &'a Method, headers: &'a HeaderMap) -> Self {
        // HTTP/2 carries the authority in the URI, HTTP/1.1 in the Host header.
        let raw_host = uri
            .host()
            .or_else(|| headers.get("host").and_then(|h| h.to_str().ok()))
            .unwrap_or("");
        Self {
            host: normalize_host(raw_host),
            path: uri.path(),
            method,
            headers,
            query: uri.query(),
        }
    }
}

/// Lowercase, strip the port and any trailing dot.
pub fn normalize_host(raw: &str) -> String {
    let without_port = if raw.starts_with('[') {
        // IPv6 literal: keep up to the closing bracket.
        raw.split_once(']').map(|(h, _)| &raw[..h.len() + 1]).unwrap_or(raw)
    } else {
        raw.rsplit_once(':').map(|(h, _)| h).unwrap_or(raw)
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &RequestInfo<'_>) -> bool;
}

impl Matcher for Rule {
    fn matches(&self, req: &RequestInfo<'_>) -> bool {
        match self {
            Rule::Host(hosts) => hosts.iter().any(|h| *h == req.host),
            Rule::Path(paths) => paths.iter().any(|p| p == req.path),
            Rule::PathPrefix(prefixes) => prefixes.iter().any(|p| req.path.starts_with(p.as_str())),
            Rule::Method(methods) => methods.iter().any(|m| m == req.method.as_str()),
            Rule::Header(name, value) => req
                .headers
                .get_all(name.as_str())
                .iter()
                .any(|v| v.to_str().map(|v| v == value).unwrap_or(false)),
            Rule::Query(key, value) => req
                .query
                .map(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .any(|(k, v)| k == key.as_str() && v == value.as_str())
                })
                .unwrap_or(false),
            Rule::And(a, b) => a.matches(req) && b.matches(req),
            Rule::Or(a, b) => a.matches(req) || b.matches(req),
            Rule::Not(inner) => !inner.matches(req),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(host: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("Host", host)
            .body(Body::default())
            .unwrap()
    }

    fn matches(rule: &str, req: &Request<Body>) -> bool {
        Rule::parse(rule).unwrap().matches(&RequestInfo::from_request(req))
    }

    #[test]
    fn test_host_matcher() {
        let req1 = request("example.com", "/");
        assert!(matches("Host(`example.com`)", &req1));

        let req2 = request("EXAMPLE.COM:8080", "/");
        assert!(matches("Host(`example.com`)", &req2)); // Case insensitive, port ignored

        let req3 = request("other.com", "/");
        assert!(!matches("Host(`example.com`)", &req3));
    }

    #[test]
    fn test_path_matcher() {
        let req1 = request("example.com", "/api/v1");
        assert!(matches("PathPrefix(`/api`)", &req1));
        assert!(!matches("Path(`/api`)", &req1));
        assert!(matches("Path(`/api/v1`)", &req1));

        let req2 = request("example.com", "/images");
        assert!(!matches("PathPrefix(`/api`)", &req2));
        assert!(!matches("PathPrefix(`/API`)", &request("example.com", "/api")));
    }

    #[test]
    fn method_header_query() {
        let req = Request::builder()
            .method("POST")
            .uri("/search?q=rust&lang=en")
            .header("Host", "example.com")
            .header("X-Env", "prod")
            .body(Body::default())
            .unwrap();

        assert!(matches("Method(`GET`, `POST`)", &req));
        assert!(!matches("Method(`GET`)", &req));
        assert!(matches("Header(`x-env`, `prod`)", &req));
        assert!(!matches("Header(`X-Env`, `dev`)", &req));
        assert!(matches("Query(`lang`, `en`)", &req));
        assert!(!matches("Query(`lang`, `fr`)", &req));
    }

    #[test]
    fn combinators() {
        let req = request("a.test", "/admin");
        assert!(matches("Host(`a.test`) && !PathPrefix(`/public`)", &req));
        assert!(!matches("Host(`a.test`) && !PathPrefix(`/admin`)", &req));
        assert!(matches("Host(`b.test`) || PathPrefix(`/adm`)", &req));
    }

    #[test]
    fn authority_from_uri() {
        let req = Request::builder()
            .uri("http://Shop.Test:8443/cart")
            .body(Body::default())
            .unwrap();
        let info = RequestInfo::from_request(&req);
        assert_eq!(info.host, "shop.test");
        assert_eq!(info.path, "/cart");
    }

    #[test]
    fn host_normalization() {
        assert_eq!(normalize_host("Example.COM."), "example.com");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host("10.0.0.1:80"), "10.0.0.1");
        assert_eq!(normalize_host(""), "");
    }
}
