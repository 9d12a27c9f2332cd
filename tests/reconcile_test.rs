//! End-to-end reconciliation: fragments in, routed traffic out.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use edge_proxy::admin::handlers::SystemStatus;
use reqwest::StatusCode;

async fn get(proxy: &edge_proxy::lifecycle::RunningProxy, host: &str, path: &str) -> (StatusCode, String) {
    let res = client()
        .get(url(proxy, path))
        .header("host", host)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.text().await.unwrap())
}

#[tokio::test]
async fn test_single_source_routes_by_host() {
    let t1 = start_mock_backend("svc1").await;
    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "a",
        &format!(
            r#"
            [routers.r1]
            rule = "Host(`shop.test`) && PathPrefix(`/`)"
            service = "svc1"

            [services.svc1.load_balancer]
            servers = [{{ url = "http://{t1}" }}]
            "#
        ),
    )
    .await;
    // Source B only knows about another host.
    publish(
        &proxy,
        "b",
        r#"
        [routers.blog]
        rule = "Host(`blog.test`)"
        service = "blog"

        [services.blog.load_balancer]
        servers = [{ url = "http://127.0.0.1:9" }]
        "#,
    )
    .await;

    assert_eq!(get(&proxy, "shop.test", "/").await, (StatusCode::OK, "svc1".into()));
    assert_eq!(get(&proxy, "other.test", "/").await.0, StatusCode::NOT_FOUND);
    proxy.stop().await;
}

#[tokio::test]
async fn test_more_specific_router_from_other_source_wins() {
    let t1 = start_mock_backend("svc1").await;
    let t2 = start_mock_backend("svc2").await;
    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "a",
        &format!(
            r#"
            [routers.r1]
            rule = "Host(`shop.test`) && PathPrefix(`/`)"
            service = "svc1"

            [services.svc1.load_balancer]
            servers = [{{ url = "http://{t1}" }}]
            "#
        ),
    )
    .await;
    publish(
        &proxy,
        "b",
        &format!(
            r#"
            [routers.r2]
            rule = "Host(`shop.test`) && PathPrefix(`/checkout`)"
            service = "svc2"

            [services.svc2.load_balancer]
            servers = [{{ url = "http://{t2}" }}]
            "#
        ),
    )
    .await;

    assert_eq!(get(&proxy, "shop.test", "/checkout").await.1, "svc2");
    assert_eq!(get(&proxy, "shop.test", "/checkout/pay").await.1, "svc2");
    assert_eq!(get(&proxy, "shop.test", "/").await.1, "svc1");
    assert_eq!(get(&proxy, "shop.test", "/cart").await.1, "svc1");
    proxy.stop().await;
}

#[tokio::test]
async fn test_unhealthy_target_never_selected() {
    let good = start_mock_backend("good").await;
    let down = Arc::new(AtomicBool::new(true));
    let flag = down.clone();
    let bad = start_programmable_backend(move || {
        let down = flag.load(Ordering::SeqCst);
        async move {
            if down {
                (503, "bad".to_string())
            } else {
                (200, "bad".to_string())
            }
        }
    })
    .await;

    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "a",
        &format!(
            r#"
            [routers.r1]
            rule = "Host(`shop.test`)"
            service = "svc1"

            [services.svc1.load_balancer]
            servers = [{{ url = "http://{good}" }}, {{ url = "http://{bad}" }}]

            [services.svc1.load_balancer.health_check]
            enabled = true
            interval_secs = 1
            timeout_secs = 1
            unhealthy_threshold = 3
            "#
        ),
    )
    .await;

    // Three failed probes, one per second.
    tokio::time::timeout(Duration::from_secs(8), async {
        loop {
            let snapshot = proxy.snapshots.load();
            let pool = snapshot.pools.server_pool("svc1@a").unwrap();
            if pool.backends.iter().any(|b| !b.is_healthy()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("target was never marked unhealthy");

    for _ in 0..100 {
        assert_eq!(get(&proxy, "shop.test", "/").await, (StatusCode::OK, "good".into()));
    }
    proxy.stop().await;
}

#[tokio::test]
async fn test_dangling_router_is_excluded_and_reported() {
    let t1 = start_mock_backend("svc1").await;
    let mut config = test_config();
    config.admin.enabled = true;
    config.admin.bind_address = "127.0.0.1:0".into();
    config.admin.api_key = "test-key".into();
    let proxy = start_proxy(config).await;
    publish(
        &proxy,
        "a",
        &format!(
            r#"
            [routers.good]
            rule = "Host(`shop.test`)"
            service = "svc1"

            [routers.broken]
            rule = "Host(`broken.test`)"
            service = "missing"

            [services.svc1.load_balancer]
            servers = [{{ url = "http://{t1}" }}]
            "#
        ),
    )
    .await;

    let snapshot = proxy.snapshots.load();
    assert!(snapshot.config.routers.contains_key("good@a"));
    assert!(!snapshot.config.routers.contains_key("broken@a"));
    assert!(snapshot
        .errors
        .iter()
        .any(|e| e.entity == "broken@a" && e.reason.contains("missing")));

    assert_eq!(get(&proxy, "shop.test", "/").await.1, "svc1");
    assert_eq!(get(&proxy, "broken.test", "/").await.0, StatusCode::NOT_FOUND);

    // The same diagnostics through the admin API.
    let admin = format!("http://{}", proxy.admin_addr.unwrap());
    let res = client().get(format!("{admin}/admin/status")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let status: SystemStatus = client()
        .get(format!("{admin}/admin/status"))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.status, "degraded");
    assert_eq!(status.generation, proxy.snapshots.generation());
    assert_eq!(status.routers, 1);

    let errors: Vec<serde_json::Value> = client()
        .get(format!("{admin}/admin/errors"))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(errors.iter().any(|e| e["entity"] == "broken@a"));
    proxy.stop().await;
}

#[tokio::test]
async fn test_inflight_request_survives_removal() {
    let slow = start_programmable_backend(|| async {
        tokio::time::sleep(Duration::from_millis(600)).await;
        (200, "svc1".to_string())
    })
    .await;
    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "a",
        &format!(
            r#"
            [routers.r1]
            rule = "Host(`shop.test`)"
            service = "svc1"

            [services.svc1.load_balancer]
            servers = [{{ url = "http://{slow}" }}]
            "#
        ),
    )
    .await;

    let inflight = tokio::spawn({
        let target = url(&proxy, "/");
        async move {
            let res = client().get(target).header("host", "shop.test").send().await.unwrap();
            let status = res.status();
            (status, res.text().await.unwrap())
        }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let before = proxy.snapshots.generation();
    proxy.publisher.remove("a").unwrap();
    wait_for_generation(&proxy, before + 1).await;

    assert_eq!(get(&proxy, "shop.test", "/").await.0, StatusCode::NOT_FOUND);
    assert_eq!(inflight.await.unwrap(), (StatusCode::OK, "svc1".into()));
    proxy.stop().await;
}

#[tokio::test]
async fn test_cross_source_reference_and_alias() {
    let t1 = start_mock_backend("shared").await;
    let proxy = start_proxy(test_config()).await;
    publish(
        &proxy,
        "infra",
        &format!(
            r#"
            [services.api.load_balancer]
            servers = [{{ url = "http://{t1}" }}]

            [aliases.services]
            shared-api = "api"
            "#
        ),
    )
    .await;
    publish(
        &proxy,
        "team",
        r#"
        [routers.qualified]
        rule = "Host(`q.test`)"
        service = "api@infra"

        [routers.aliased]
        rule = "Host(`a.test`)"
        service = "shared-api"
        "#,
    )
    .await;

    assert_eq!(get(&proxy, "q.test", "/").await.1, "shared");
    assert_eq!(get(&proxy, "a.test", "/").await.1, "shared");
    proxy.stop().await;
}

#[tokio::test]
async fn test_merge_is_independent_of_arrival_order() {
    let a = r#"
        [routers.r1]
        rule = "Host(`one.test`)"
        service = "s"

        [services.s.load_balancer]
        servers = [{ url = "http://127.0.0.1:9" }]
    "#;
    let b = r#"
        [routers.r1]
        rule = "Host(`two.test`)"
        service = "s"

        [services.s.load_balancer]
        servers = [{ url = "http://127.0.0.1:10" }]
    "#;

    let first = start_proxy(test_config()).await;
    publish(&first, "a", a).await;
    publish(&first, "b", b).await;

    let second = start_proxy(test_config()).await;
    publish(&second, "b", b).await;
    publish(&second, "a", a).await;

    let left = first.snapshots.load();
    let right = second.snapshots.load();
    assert_eq!(left.config.canonical_bytes(), right.config.canonical_bytes());
    assert_eq!(left.routes.len(), 2);

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn test_republishing_same_fragment_keeps_generation() {
    let raw = r#"
        [routers.r1]
        rule = "Host(`one.test`)"
        service = "s"

        [services.s.load_balancer]
        servers = [{ url = "http://127.0.0.1:9" }]
    "#;
    let proxy = start_proxy(test_config()).await;
    publish(&proxy, "a", raw).await;
    let generation = proxy.snapshots.generation();

    proxy
        .publisher
        .replace("a", toml::from_str(raw).unwrap())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(proxy.snapshots.generation(), generation);
    proxy.stop().await;
}

#[tokio::test]
async fn test_file_provider_hot_reload() {
    let t1 = start_mock_backend("v1").await;
    let t2 = start_mock_backend("v2").await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("site.toml");
    let fragment = |target: std::net::SocketAddr| {
        format!(
            r#"
            [routers.site]
            rule = "Host(`site.test`)"
            service = "web"

            [services.web.load_balancer]
            servers = [{{ url = "http://{target}" }}]
            "#
        )
    };
    std::fs::write(&path, fragment(t1)).unwrap();

    let mut config = test_config();
    config.providers.files.push(edge_proxy::config::schema::FileProviderConfig {
        name: "files".into(),
        path: path.display().to_string(),
        watch: true,
    });
    let proxy = start_proxy(config).await;
    assert_eq!(get(&proxy, "site.test", "/").await.1, "v1");

    let before = proxy.snapshots.generation();
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&path, fragment(t2)).unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while proxy.snapshots.generation() == before {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("file change was not reconciled");
    assert_eq!(get(&proxy, "site.test", "/").await.1, "v2");
    proxy.stop().await;
}
