//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edge_proxy::config::ProxyConfig;
use edge_proxy::lifecycle::{start, RunningProxy};
use edge_proxy::TopologyFragment;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What a mock backend saw.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
}

impl MockRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<MockRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut start = lines.next()?.split(' ');
    let method = start.next()?.to_string();
    let path = start.next()?.to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    // Drain the body so closing the socket does not reset the connection.
    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut have = buf.len() - (head_end + 4);
    while have < length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        have += n;
    }

    Some(MockRequest {
        method,
        path,
        headers,
    })
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        401 => "401 Unauthorized",
        404 => "404 Not Found",
        429 => "429 Too Many Requests",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

/// Start a backend whose answer is computed from the request.
pub async fn start_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(MockRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, Vec<(String, String)>, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let Some(request) = read_request(&mut socket).await else {
                            return;
                        };
                        let (status, headers, body) = f(request).await;
                        let mut response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                            status_text(status),
                            body.len()
                        );
                        for (k, v) in headers {
                            response.push_str(&format!("{}: {}\r\n", k, v));
                        }
                        response.push_str("\r\n");
                        response.push_str(&body);
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Start a programmable backend that ignores the request.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let f = Arc::new(f);
    start_backend(move |_| {
        let f = f.clone();
        async move {
            let (status, body) = f().await;
            (status, Vec::new(), body)
        }
    })
    .await
}

/// Start a simple mock backend that returns a fixed response.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move || async move { (200, response.to_string()) }).await
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Static config for tests: ephemeral port, no debounce, no probes, no metrics.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.reconcile.debounce_ms = 0;
    config.health_check.enabled = false;
    config.observability.metrics_enabled = false;
    config.retries.budget_ratio = 1.0;
    config
}

pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    start(config).await.expect("proxy failed to start")
}

/// Publish `raw` as `source`'s fragment and wait for the next generation.
pub async fn publish(proxy: &RunningProxy, source: &str, raw: &str) {
    let fragment: TopologyFragment = toml::from_str(raw).expect("fragment parses");
    let before = proxy.snapshots.generation();
    proxy.publisher.replace(source, fragment).unwrap();
    wait_for_generation(proxy, before + 1).await;
}

pub async fn wait_for_generation(proxy: &RunningProxy, generation: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while proxy.snapshots.generation() < generation {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("snapshot was not published");
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

pub fn url(proxy: &RunningProxy, path: &str) -> String {
    format!("http://{}{}", proxy.proxy_addr, path)
}
