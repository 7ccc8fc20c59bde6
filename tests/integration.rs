//! End-to-end tests: the proxy listener, admin API and a live mock backend

mod common;

use common::{
    closed_port, http_get, http_request, spawn_backend, start_proxy, test_settings,
    wait_for_status, Harness, MockRuntime,
};
use delne::db::ServiceStatus;
use std::time::Duration;

const TOKEN: &str = "test-token";
const AUTH: (&str, &str) = ("Authorization", "Bearer test-token");

#[tokio::test]
async fn test_static_route_rewrites_path() {
    let backend = spawn_backend().await;
    let h = Harness::new();
    h.routes
        .register("foo.local/test", &format!("http://127.0.0.1:{}", backend.port()));
    let proxy = start_proxy(&h, None, Duration::from_secs(5)).await;

    let response = http_get(proxy.port(), "/test/users?page=2", "foo.local").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "GET /users?page=2");
    assert_eq!(response.header("x-seen-forwarded-host"), Some("foo.local"));

    let response = http_get(proxy.port(), "/test", "foo.local").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "GET /");
}

#[tokio::test]
async fn test_static_route_keeps_base_path() {
    let backend = spawn_backend().await;
    let h = Harness::new();
    h.routes
        .register("bar.local", &format!("http://127.0.0.1:{}/api", backend.port()));
    let proxy = start_proxy(&h, None, Duration::from_secs(5)).await;

    let response = http_get(proxy.port(), "/v1/items", "Bar.Local:8080").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "GET /api/v1/items");
}

#[tokio::test]
async fn test_unknown_host_returns_404() {
    let h = Harness::new();
    h.routes.register("known.local", "web");
    let proxy = start_proxy(&h, None, Duration::from_secs(5)).await;

    let response = http_get(proxy.port(), "/", "unknown.local").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("x-proxy-error"), Some("UNKNOWN_HOST"));
    assert_eq!(response.json()["code"], "UNKNOWN_HOST");
}

#[tokio::test]
async fn test_missing_host_header_returns_400() {
    let h = Harness::new();
    let proxy = start_proxy(&h, None, Duration::from_secs(5)).await;

    let response = http_request(proxy.port(), "GET", "/", None, &[], None).await;
    assert_eq!(response.status, 400);
    assert_eq!(response.header("x-proxy-error"), Some("MISSING_HOST_HEADER"));
}

#[tokio::test]
async fn test_route_to_unknown_service_returns_backend_not_found() {
    let h = Harness::new();
    h.routes.register("ghost.local", "ghost");
    let proxy = start_proxy(&h, None, Duration::from_secs(5)).await;

    let response = http_get(proxy.port(), "/", "ghost.local").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("x-proxy-error"), Some("BACKEND_NOT_FOUND"));
}

#[tokio::test]
async fn test_unreachable_backend_returns_502() {
    let port = closed_port().await;
    let h = Harness::new();
    h.routes.register("down.local", &format!("http://127.0.0.1:{}", port));
    let proxy = start_proxy(&h, None, Duration::from_secs(5)).await;

    let response = http_get(proxy.port(), "/", "down.local").await;
    assert_eq!(response.status, 502);
    assert_eq!(response.header("x-proxy-error"), Some("CONNECTION_FAILED"));

    let response = http_get(proxy.port(), "/admin/api/healthcheck", "proxy.local").await;
    let requests = &response.json()["data"]["requests"];
    assert_eq!(requests["total"], 1);
    assert_eq!(requests["failed"], 1);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let backend = spawn_backend().await;
    let h = Harness::new();
    h.routes
        .register("slow.local", &format!("http://127.0.0.1:{}", backend.port()));
    let proxy = start_proxy(&h, None, Duration::from_millis(300)).await;

    let response = http_get(proxy.port(), "/slow", "slow.local").await;
    assert_eq!(response.status, 504);
    assert_eq!(response.header("x-proxy-error"), Some("REQUEST_TIMEOUT"));
}

#[tokio::test]
async fn test_admin_healthcheck_and_auth() {
    let h = Harness::new();
    let proxy = start_proxy(&h, Some(TOKEN), Duration::from_secs(5)).await;

    let response = http_get(proxy.port(), "/admin/api/healthcheck", "proxy.local").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()["data"]["status"], "ok");

    let response = http_get(proxy.port(), "/admin/api/proxies", "proxy.local").await;
    assert_eq!(response.status, 401);
    assert_eq!(response.json()["success"], false);

    let response = http_request(
        proxy.port(),
        "GET",
        "/admin/api/proxies",
        Some("proxy.local"),
        &[AUTH],
        None,
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()["data"], serde_json::json!([]));

    let response = http_request(
        proxy.port(),
        "GET",
        "/admin/api/nothing",
        Some("proxy.local"),
        &[AUTH],
        None,
    )
    .await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_admin_prefix_does_not_capture_similar_paths() {
    let backend = spawn_backend().await;
    let h = Harness::new();
    h.routes
        .register("site.local", &format!("http://127.0.0.1:{}", backend.port()));
    let proxy = start_proxy(&h, None, Duration::from_secs(5)).await;

    let response = http_get(proxy.port(), "/administrator", "site.local").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "GET /administrator");
}

#[tokio::test]
async fn test_admin_registers_and_rebinds_routes() {
    let backend = spawn_backend().await;
    let h = Harness::new();
    let proxy = start_proxy(&h, Some(TOKEN), Duration::from_secs(5)).await;
    let target = format!("http://127.0.0.1:{}", backend.port());

    let body = serde_json::json!({ "host": "app.local", "target": target }).to_string();
    let response = http_request(
        proxy.port(),
        "POST",
        "/admin/api/proxies",
        Some("proxy.local"),
        &[AUTH],
        Some(&body),
    )
    .await;
    assert_eq!(response.status, 201);
    assert_eq!(http_get(proxy.port(), "/hello", "app.local").await.body, "GET /hello");

    let body = serde_json::json!({ "host": "app2.local", "target": target }).to_string();
    let response = http_request(
        proxy.port(),
        "PUT",
        "/admin/api/proxies/app.local",
        Some("proxy.local"),
        &[AUTH],
        Some(&body),
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(http_get(proxy.port(), "/", "app.local").await.status, 404);
    assert_eq!(http_get(proxy.port(), "/", "app2.local").await.status, 200);

    let response = http_request(
        proxy.port(),
        "POST",
        "/admin/api/proxies",
        Some("proxy.local"),
        &[AUTH],
        Some(r#"{"host": "", "target": "web"}"#),
    )
    .await;
    assert_eq!(response.status, 400);
    assert_eq!(response.json()["success"], false);
}

#[tokio::test]
async fn test_managed_service_end_to_end() {
    let backend = spawn_backend().await;
    let runtime = MockRuntime::new();
    runtime.set_ports(vec![backend.port()]);
    let h = Harness::with(runtime, test_settings());
    let proxy = start_proxy(&h, Some(TOKEN), Duration::from_secs(5)).await;

    // The service name doubles as its hostname on the container network
    let body = r#"{"name": "localhost", "image": "acme/app:v2", "host": "app.local"}"#;
    let response = http_request(
        proxy.port(),
        "POST",
        "/admin/api/services",
        Some("proxy.local"),
        &[AUTH],
        Some(body),
    )
    .await;
    assert_eq!(response.status, 201);
    let json = response.json();
    assert_eq!(json["data"]["name"], "localhost");
    assert_eq!(json["data"]["image"]["repository"], "acme");
    assert_eq!(json["data"]["image"]["tag"], "v2");

    assert!(
        wait_for_status(&h.db, "localhost", ServiceStatus::Running, Duration::from_secs(5)).await
    );

    let response = http_get(proxy.port(), "/orders?id=7", "app.local").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "GET /orders?id=7");

    let response = http_request(
        proxy.port(),
        "POST",
        "/admin/api/services/localhost/start",
        Some("proxy.local"),
        &[AUTH],
        None,
    )
    .await;
    assert_eq!(response.status, 409);

    let response = http_request(
        proxy.port(),
        "POST",
        "/admin/api/services/localhost/stop",
        Some("proxy.local"),
        &[AUTH],
        None,
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()["data"]["status"], "STOPPED");

    let response = http_get(proxy.port(), "/orders", "app.local").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("x-proxy-error"), Some("BACKEND_NOT_FOUND"));

    let response = http_request(
        proxy.port(),
        "DELETE",
        "/admin/api/services/localhost",
        Some("proxy.local"),
        &[AUTH],
        None,
    )
    .await;
    assert_eq!(response.status, 200);

    let response = http_get(proxy.port(), "/orders", "app.local").await;
    assert_eq!(response.header("x-proxy-error"), Some("UNKNOWN_HOST"));
}

#[tokio::test]
async fn test_admin_env_endpoints() {
    let h = Harness::new();
    h.create_and_wait("web", &["web.local"]).await;
    let proxy = start_proxy(&h, Some(TOKEN), Duration::from_secs(5)).await;

    let response = http_request(
        proxy.port(),
        "PUT",
        "/admin/api/services/web/env",
        Some("proxy.local"),
        &[AUTH],
        Some(r#"{"env": {"MODE": "production", "DSN": "a=b"}}"#),
    )
    .await;
    assert_eq!(response.status, 202);
    assert_eq!(response.json()["data"]["env"]["MODE"], "production");
    assert!(wait_for_status(&h.db, "web", ServiceStatus::Running, Duration::from_secs(5)).await);

    let response = http_request(
        proxy.port(),
        "DELETE",
        "/admin/api/services/web/env/NOPE",
        Some("proxy.local"),
        &[AUTH],
        None,
    )
    .await;
    assert_eq!(response.status, 404);

    let response = http_request(
        proxy.port(),
        "DELETE",
        "/admin/api/services/web/env/MODE",
        Some("proxy.local"),
        &[AUTH],
        None,
    )
    .await;
    assert_eq!(response.status, 202);
    assert!(response.json()["data"]["env"].get("MODE").is_none());

    let response = http_request(
        proxy.port(),
        "GET",
        "/admin/api/services",
        Some("proxy.local"),
        &[AUTH],
        None,
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()["data"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_admin_decodes_path_segments() {
    let h = Harness::new();
    h.routes.register("a.local/x", "http://127.0.0.1:9");
    let proxy = start_proxy(&h, None, Duration::from_secs(5)).await;

    let body = r#"{"host": "b.local/y", "target": "http://127.0.0.1:9"}"#;
    let response = http_request(
        proxy.port(),
        "PUT",
        "/admin/api/proxies/a.local%2Fx",
        Some("proxy.local"),
        &[],
        Some(body),
    )
    .await;
    assert_eq!(response.status, 200);

    let routes = h.routes.list_all();
    assert!(routes.contains_key("b.local/y"));
    assert!(!routes.contains_key("a.local/x"));
}
