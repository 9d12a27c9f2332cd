//! Upstream HTTP client shared by the dispatcher and forward-auth.

use std::time::Duration;

use axum::body::Body;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::config::schema::TimeoutConfig;

pub type HttpClient = Client<HttpConnector, Body>;

/// Pooled client with the configured connect and idle timeouts.
pub fn build_client(timeouts: &TimeoutConfig) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(Duration::from_secs(timeouts.connect_secs)));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(timeouts.idle_secs))
        .build(connector)
}
