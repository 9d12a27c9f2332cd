//! Header and path rewriting middlewares.

use axum::http::header::{HeaderName, HeaderValue, InvalidHeaderName, InvalidHeaderValue};
use axum::http::request::Parts;
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderMap, Uri};

use crate::dynamic::types::HeadersConfig;

pub const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("invalid header name `{name}`: {source}")]
    HeaderName {
        name: String,
        #[source]
        source: InvalidHeaderName,
    },
    #[error("invalid value for header `{name}`: {source}")]
    HeaderValue {
        name: String,
        #[source]
        source: InvalidHeaderValue,
    },
    #[error("prefix `{0}` must start with '/'")]
    Prefix(String),
}

/// Compiled header edits. `None` removes the header.
#[derive(Debug)]
pub struct HeaderRewrite {
    request: Vec<(HeaderName, Option<HeaderValue>)>,
    response: Vec<(HeaderName, Option<HeaderValue>)>,
}

fn compile_edits(
    raw: &std::collections::BTreeMap<String, String>,
) -> Result<Vec<(HeaderName, Option<HeaderValue>)>, RewriteError> {
    raw.iter()
        .map(|(name, value)| {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|source| {
                RewriteError::HeaderName {
                    name: name.clone(),
                    source,
                }
            })?;
            let value = if value.is_empty() {
                None
            } else {
                Some(HeaderValue::from_str(value).map_err(|source| {
                    RewriteError::HeaderValue {
                        name: name.clone(),
                        source,
                    }
                })?)
            };
            Ok((header, value))
        })
        .collect()
}

fn apply_edits(headers: &mut HeaderMap, edits: &[(HeaderName, Option<HeaderValue>)]) {
    for (name, value) in edits {
        match value {
            Some(v) => {
                headers.insert(name.clone(), v.clone());
            }
            None => {
                headers.remove(name);
            }
        }
    }
}

impl HeaderRewrite {
    pub fn compile(config: &HeadersConfig) -> Result<Self, RewriteError> {
        Ok(Self {
            request: compile_edits(&config.request)?,
            response: compile_edits(&config.response)?,
        })
    }

    pub fn apply_request(&self, headers: &mut HeaderMap) {
        apply_edits(headers, &self.request);
    }

    pub fn apply_response(&self, headers: &mut HeaderMap) {
        apply_edits(headers, &self.response);
    }
}

/// Replace the path of `parts.uri`, keeping the query.
pub fn set_path(parts: &mut Parts, path: &str) {
    let path_and_query = match parts.uri.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    };
    let Ok(pq) = path_and_query.parse::<PathAndQuery>() else {
        return;
    };
    let mut uri_parts = parts.uri.clone().into_parts();
    uri_parts.path_and_query = Some(pq);
    if let Ok(uri) = Uri::from_parts(uri_parts) {
        parts.uri = uri;
    }
}

/// Removes the longest matching prefix from the path.
#[derive(Debug)]
pub struct StripPrefix {
    prefixes: Vec<String>,
}

impl StripPrefix {
    pub fn new(prefixes: &[String]) -> Result<Self, RewriteError> {
        let mut prefixes: Vec<String> = prefixes
            .iter()
            .map(|p| {
                if p.starts_with('/') {
                    Ok(p.trim_end_matches('/').to_string())
                } else {
                    Err(RewriteError::Prefix(p.clone()))
                }
            })
            .collect::<Result<_, _>>()?;
        prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));
        Ok(Self { prefixes })
    }

    pub fn apply(&self, parts: &mut Parts) {
        let path = parts.uri.path().to_string();
        let matched = self.prefixes.iter().find(|prefix| {
            path.strip_prefix(prefix.as_str())
                .map(|rest| rest.is_empty() || rest.starts_with('/'))
                .unwrap_or(false)
        });
        let Some(prefix) = matched else { return };
        if prefix.is_empty() {
            return;
        }

        let rest = &path[prefix.len()..];
        let new_path = if rest.is_empty() { "/" } else { rest };
        if let Ok(v) = HeaderValue::from_str(prefix) {
            parts.headers.insert(X_FORWARDED_PREFIX, v);
        }
        set_path(parts, new_path);
    }
}

/// Prepends a fixed prefix to the path.
#[derive(Debug)]
pub struct AddPrefix {
    prefix: String,
}

impl AddPrefix {
    pub fn new(prefix: &str) -> Result<Self, RewriteError> {
        if !prefix.starts_with('/') {
            return Err(RewriteError::Prefix(prefix.to_string()));
        }
        Ok(Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    pub fn apply(&self, parts: &mut Parts) {
        let path = format!("{}{}", self.prefix, parts.uri.path());
        set_path(parts, &path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str) -> Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    #[test]
    fn strip_longest_prefix() {
        let strip = StripPrefix::new(&["/api".into(), "/api/v1".into()]).unwrap();
        let mut p = parts("/api/v1/users?page=2");
        strip.apply(&mut p);
        assert_eq!(p.uri.path(), "/users");
        assert_eq!(p.uri.query(), Some("page=2"));
        assert_eq!(p.headers[X_FORWARDED_PREFIX], "/api/v1");

        let mut root = parts("/api");
        strip.apply(&mut root);
        assert_eq!(root.uri.path(), "/");
    }

    #[test]
    fn strip_respects_segments() {
        let strip = StripPrefix::new(&["/api".into()]).unwrap();
        let mut p = parts("/apiary");
        strip.apply(&mut p);
        assert_eq!(p.uri.path(), "/apiary");
        assert!(!p.headers.contains_key(X_FORWARDED_PREFIX));
    }

    #[test]
    fn add_prefix() {
        let add = AddPrefix::new("/v2/").unwrap();
        let mut p = parts("/items?x=1");
        add.apply(&mut p);
        assert_eq!(p.uri.path(), "/v2/items");
        assert_eq!(p.uri.query(), Some("x=1"));
        assert!(AddPrefix::new("v2").is_err());
    }

    #[test]
    fn header_edits() {
        let mut config = HeadersConfig::default();
        config.request.insert("X-Env".into(), "prod".into());
        config.request.insert("X-Remove".into(), String::new());
        config.response.insert("X-Served-By".into(), "edge".into());
        let rewrite = HeaderRewrite::compile(&config).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-remove", HeaderValue::from_static("1"));
        rewrite.apply_request(&mut headers);
        assert_eq!(headers["x-env"], "prod");
        assert!(!headers.contains_key("x-remove"));

        let mut response = HeaderMap::new();
        rewrite.apply_response(&mut response);
        assert_eq!(response["x-served-by"], "edge");
    }

    #[test]
    fn bad_header_rejected() {
        let mut config = HeadersConfig::default();
        config.request.insert("bad header".into(), "x".into());
        assert!(HeaderRewrite::compile(&config).is_err());
    }
}
