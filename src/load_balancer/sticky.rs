//! Sticky sessions.
//!
//! A cookie pins a client to a target. The cookie value is the target's
//! fingerprint; any other value is hashed onto the target list. When the
//! pinned target is not eligible the request falls back to the pool's
//! strategy, and the existing cookie is left untouched.

use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue};

use crate::load_balancer::backend::{fnv1a, Backend};
use crate::load_balancer::Eligibility;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sticky {
    pub cookie: String,
}

impl Sticky {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
        }
    }

    /// Value of the sticky cookie in the request, if any.
    pub fn cookie_value(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie)
            .map(|(_, value)| value.trim().to_string())
    }

    /// The target this value maps to, if that target is eligible.
    pub fn pinned(
        &self,
        value: &str,
        backends: &[Arc<Backend>],
        eligibility: &Eligibility<'_>,
    ) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        let target = backends
            .iter()
            .find(|b| b.fingerprint() == value)
            .unwrap_or_else(|| &backends[(fnv1a(value.as_bytes()) % backends.len() as u64) as usize]);
        eligibility.allows(target).then(|| target.clone())
    }

    /// `Set-Cookie` value pinning the client to `backend`.
    pub fn set_cookie(&self, backend: &Backend) -> Option<HeaderValue> {
        HeaderValue::from_str(&format!(
            "{}={}; Path=/; HttpOnly",
            self.cookie,
            backend.fingerprint()
        ))
        .ok()
    }
}
