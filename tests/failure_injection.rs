//! Failure injection: dead, slow, flapping and saturated targets.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use reqwest::StatusCode;

fn counting_backend(
    hits: Arc<AtomicUsize>,
    status: u16,
    body: &'static str,
) -> impl Fn() -> std::future::Ready<(u16, String)> + Send + Sync + 'static {
    move || {
        hits.fetch_add(1, Ordering::SeqCst);
        std::future::ready((status, body.to_string()))
    }
}

#[tokio::test]
async fn test_retry_moves_to_another_target() {
    let dead = closed_port().await;
    let alive = start_mock_backend("alive").await;

    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "pool"
            middlewares = ["retry"]

            [services.pool.load_balancer]
            servers = [{{ url = "http://{dead}" }}, {{ url = "http://{alive}" }}]

            [middlewares.retry.retry]
            attempts = 2
            initial_interval_ms = 1
            "#
        ),
    )
    .await;

    let client = client();
    for _ in 0..6 {
        let res = client.get(url(&proxy, "/")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.text().await.unwrap(), "alive");
    }
    proxy.stop().await;
}

#[tokio::test]
async fn test_no_retry_without_retry_middleware() {
    let dead = closed_port().await;
    let alive = start_mock_backend("alive").await;

    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "pool"

            [services.pool.load_balancer]
            servers = [{{ url = "http://{dead}" }}, {{ url = "http://{alive}" }}]
            "#
        ),
    )
    .await;

    let client = client();
    let mut bad_gateway = 0;
    for _ in 0..4 {
        let res = client.get(url(&proxy, "/")).send().await.unwrap();
        if res.status() == StatusCode::BAD_GATEWAY {
            bad_gateway += 1;
        }
    }
    assert!(bad_gateway > 0, "dead target should surface as 502");
    proxy.stop().await;
}

#[tokio::test]
async fn test_retries_only_idempotent_and_never_same_target() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let a = start_programmable_backend(counting_backend(first.clone(), 503, "busy")).await;
    let b = start_programmable_backend(counting_backend(second.clone(), 503, "busy")).await;

    let mut config = test_config();
    // Keep both targets routable through the whole test.
    config.health_check.passive = false;
    let proxy = start_proxy(config).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "pool"
            middlewares = ["retry"]

            [services.pool.load_balancer]
            servers = [{{ url = "http://{a}" }}, {{ url = "http://{b}" }}]

            [middlewares.retry.retry]
            attempts = 2
            initial_interval_ms = 1
            "#
        ),
    )
    .await;

    let client = client();
    let res = client.post(url(&proxy, "/order")).body("x").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(first.load(Ordering::SeqCst) + second.load(Ordering::SeqCst), 1);

    let res = client.get(url(&proxy, "/order")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    // Two targets: one retry, then nothing left to try.
    assert_eq!(first.load(Ordering::SeqCst) + second.load(Ordering::SeqCst), 3);
    assert!(first.load(Ordering::SeqCst) >= 1 && second.load(Ordering::SeqCst) >= 1);
    proxy.stop().await;
}

#[tokio::test]
async fn test_slow_target_times_out() {
    let slow = start_programmable_backend(|| async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        (200, "late".to_string())
    })
    .await;

    let mut config = test_config();
    config.timeouts.request_secs = 1;
    let proxy = start_proxy(config).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "slow"

            [services.slow.load_balancer]
            servers = [{{ url = "http://{slow}" }}]
            "#
        ),
    )
    .await;

    let res = client().get(url(&proxy, "/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    proxy.stop().await;
}

#[tokio::test]
async fn test_unmatched_request_gets_404() {
    let backend = start_mock_backend("api").await;
    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.api]
            rule = "PathPrefix(`/api`)"
            service = "api"

            [services.api.load_balancer]
            servers = [{{ url = "http://{backend}" }}]
            "#
        ),
    )
    .await;

    let client = client();
    let res = client.get(url(&proxy, "/api/x")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(url(&proxy, "/other")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(res.text().await.unwrap(), "404 page not found");
    proxy.stop().await;
}

async fn unhealthy_pool_status(fail_open: bool) -> StatusCode {
    let dead = closed_port().await;
    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "pool"

            [services.pool.load_balancer]
            servers = [{{ url = "http://{dead}" }}]
            fail_open = {fail_open}

            [services.pool.load_balancer.health_check]
            unhealthy_threshold = 1
            "#
        ),
    )
    .await;

    let client = client();
    // The first failure evicts the only target.
    let res = client.get(url(&proxy, "/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    let res = client.get(url(&proxy, "/")).send().await.unwrap();
    let status = res.status();
    proxy.stop().await;
    status
}

#[tokio::test]
async fn test_fail_closed_answers_503() {
    assert_eq!(unhealthy_pool_status(false).await, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_fail_open_still_forwards() {
    // Forwarded to the unhealthy target, which is still down.
    assert_eq!(unhealthy_pool_status(true).await, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_health_eviction() {
    let good = start_mock_backend("good").await;
    let down = Arc::new(AtomicBool::new(false));
    let flag = down.clone();
    let flapping = start_programmable_backend(move || {
        let down = flag.load(Ordering::SeqCst);
        async move {
            if down {
                (500, "down".to_string())
            } else {
                (200, "flapping".to_string())
            }
        }
    })
    .await;

    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "pool"

            [services.pool.load_balancer]
            servers = [{{ url = "http://{good}" }}, {{ url = "http://{flapping}" }}]

            [services.pool.load_balancer.health_check]
            enabled = true
            interval_secs = 1
            timeout_secs = 1
            unhealthy_threshold = 1
            healthy_threshold = 1
            "#
        ),
    )
    .await;

    down.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let client = client();
    for _ in 0..6 {
        let res = client.get(url(&proxy, "/")).send().await.unwrap();
        assert_eq!(res.text().await.unwrap(), "good");
    }

    down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let mut seen_flapping = false;
    for _ in 0..6 {
        let res = client.get(url(&proxy, "/")).send().await.unwrap();
        if res.text().await.unwrap() == "flapping" {
            seen_flapping = true;
        }
    }
    assert!(seen_flapping, "recovered target should be routed again");
    proxy.stop().await;
}

#[tokio::test]
async fn test_hung_health_check_does_not_delay_other_services() {
    let hung = start_programmable_backend(|| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        (200, "late".to_string())
    })
    .await;
    let failing = start_programmable_backend(|| async { (503, "down".to_string()) }).await;

    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.slow]
            rule = "Host(`slow.test`)"
            service = "slow"

            [routers.flaky]
            rule = "Host(`flaky.test`)"
            service = "flaky"

            [services.slow.load_balancer]
            servers = [{{ url = "http://{hung}" }}]

            [services.slow.load_balancer.health_check]
            enabled = true
            interval_secs = 1
            timeout_secs = 10

            [services.flaky.load_balancer]
            servers = [{{ url = "http://{failing}" }}]

            [services.flaky.load_balancer.health_check]
            enabled = true
            interval_secs = 1
            timeout_secs = 1
            unhealthy_threshold = 3
            "#
        ),
    )
    .await;

    // Three rounds of the fast service fit well inside one hung probe.
    tokio::time::timeout(Duration::from_secs(6), async {
        loop {
            let snapshot = proxy.snapshots.load();
            let pool = snapshot.pools.server_pool("flaky@static").unwrap();
            if !pool.backends[0].is_healthy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("probes of the fast service were held up");
    proxy.stop().await;
}

#[tokio::test]
async fn test_max_connections_saturation() {
    let slow = start_programmable_backend(|| async {
        tokio::time::sleep(Duration::from_millis(800)).await;
        (200, "slow".to_string())
    })
    .await;

    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "pool"

            [services.pool.load_balancer]
            servers = [{{ url = "http://{slow}", max_connections = 1 }}]
            "#
        ),
    )
    .await;

    let client = client();
    let first = tokio::spawn({
        let client = client.clone();
        let target = url(&proxy, "/");
        async move {
            let res = client.get(target).send().await.unwrap();
            let status = res.status();
            let _ = res.text().await;
            status
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let res = client.get(url(&proxy, "/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(first.await.unwrap(), StatusCode::OK);

    // The slot is released once the first response completes.
    let res = client.get(url(&proxy, "/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    proxy.stop().await;
}

#[tokio::test]
async fn test_rate_limit_rejects_burst() {
    let backend = start_mock_backend("ok").await;
    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "pool"
            middlewares = ["limit"]

            [services.pool.load_balancer]
            servers = [{{ url = "http://{backend}" }}]

            [middlewares.limit.rate_limit]
            average = 1
            burst = 2
            "#
        ),
    )
    .await;

    let client = client();
    let mut statuses = Vec::new();
    for _ in 0..5 {
        statuses.push(client.get(url(&proxy, "/")).send().await.unwrap().status());
    }
    assert_eq!(statuses[0], StatusCode::OK);
    assert!(statuses.contains(&StatusCode::TOO_MANY_REQUESTS));
    proxy.stop().await;
}

#[tokio::test]
async fn test_rewrites_reach_the_backend() {
    let echo = start_backend(|req| async move {
        let env = req.header("x-env").unwrap_or("-").to_string();
        (200, Vec::new(), format!("{} {}", req.path, env))
    })
    .await;

    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.api]
            rule = "PathPrefix(`/api`)"
            service = "echo"
            middlewares = ["strip", "tag"]

            [services.echo.load_balancer]
            servers = [{{ url = "http://{echo}" }}]

            [middlewares.strip.strip_prefix]
            prefixes = ["/api"]

            [middlewares.tag.headers.request]
            X-Env = "test"

            [middlewares.tag.headers.response]
            X-Served-By = "edge"
            "#
        ),
    )
    .await;

    let res = client().get(url(&proxy, "/api/items?page=2")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-served-by"], "edge");
    assert_eq!(res.text().await.unwrap(), "/items?page=2 test");
    proxy.stop().await;
}

#[tokio::test]
async fn test_circuit_breaker_opens() {
    let hits = Arc::new(AtomicUsize::new(0));
    let failing = start_programmable_backend(counting_backend(hits.clone(), 500, "boom")).await;

    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "pool"
            middlewares = ["breaker"]

            [services.pool.load_balancer]
            servers = [{{ url = "http://{failing}" }}]

            [middlewares.breaker.circuit_breaker]
            failure_threshold = 2
            open_duration_ms = 60000
            "#
        ),
    )
    .await;

    let client = client();
    for _ in 0..2 {
        let res = client.get(url(&proxy, "/")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    let res = client.get(url(&proxy, "/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    proxy.stop().await;
}

#[tokio::test]
async fn test_cancelled_half_open_request_releases_breaker() {
    let hang = Arc::new(AtomicBool::new(true));
    let flag = hang.clone();
    let backend = start_programmable_backend(move || {
        let hang = flag.load(Ordering::SeqCst);
        async move {
            if hang {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            (200, "back".to_string())
        }
    })
    .await;

    let mut config = test_config();
    config.timeouts.request_secs = 1;
    let proxy = start_proxy(config).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "pool"
            middlewares = ["breaker"]

            [services.pool.load_balancer]
            servers = [{{ url = "http://{backend}" }}]

            [middlewares.breaker.circuit_breaker]
            failure_threshold = 1
            open_duration_ms = 50
            "#
        ),
    )
    .await;

    let res = client().get(url(&proxy, "/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The half-open request is abandoned by its client.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        client().get(url(&proxy, "/")).send(),
    )
    .await;
    assert!(abandoned.is_err());

    hang.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let res = client().get(url(&proxy, "/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "back");
    proxy.stop().await;
}

#[tokio::test]
async fn test_forward_auth() {
    let auth = start_backend(|req| async move {
        if req.header("authorization") == Some("Bearer letmein") {
            (200, vec![("X-User".to_string(), "alice".to_string())], String::new())
        } else {
            (401, Vec::new(), "denied".to_string())
        }
    })
    .await;
    let app = start_backend(|req| async move {
        let user = req.header("x-user").unwrap_or("anonymous").to_string();
        (200, Vec::new(), user)
    })
    .await;

    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "static",
        &format!(
            r#"
            [routers.web]
            rule = "PathPrefix(`/`)"
            service = "app"
            middlewares = ["auth"]

            [services.app.load_balancer]
            servers = [{{ url = "http://{app}" }}]

            [middlewares.auth.forward_auth]
            address = "http://{auth}/verify"
            auth_response_headers = ["X-User"]
            "#
        ),
    )
    .await;

    let client = client();
    let res = client.get(url(&proxy, "/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.text().await.unwrap(), "denied");

    let res = client
        .get(url(&proxy, "/"))
        .bearer_auth("letmein")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "alice");
    proxy.stop().await;
}
