//! Integration tests for the HTTP front end

mod common;

use bytes::Bytes;
use common::MockBackend;
use delta_proxy::server::{route, PurgeResponse, CACHE_STATUS_HEADER, MAX_FORM_BYTES};
use delta_proxy::{BackendRegistry, DeltaProxy, MemoryStore, ProxyServer};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

fn proxy(backend: Arc<MockBackend>) -> DeltaProxy {
    let mut registry = BackendRegistry::new(4);
    registry.register(backend);
    DeltaProxy::new(Arc::new(MemoryStore::new()), registry, Duration::from_secs(3600))
}

fn request(method: Method, uri: &str, body: &'static str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

async fn body_of(response: http::Response<Full<Bytes>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

const RANGE: &str = "/mock/api/v1/query_range?query=metric&start=100&end=200&step=10";

#[tokio::test]
async fn test_query_range_reports_cache_status() {
    let backend = Arc::new(MockBackend::new("mock", &["h1"]));
    let proxy = proxy(backend.clone());

    let first = route(&proxy, request(Method::GET, RANGE, "")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[CACHE_STATUS_HEADER], "miss");
    assert_eq!(
        body_of(first).await,
        Bytes::from("[100, 110, 120, 130, 140, 150, 160, 170, 180, 190]")
    );

    // the mock parses timestamps as milliseconds, so now is far past the cutoff
    let second = route(&proxy, request(Method::GET, RANGE, "")).await;
    assert_eq!(second.headers()[CACHE_STATUS_HEADER], "hit");
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn test_post_form_body() {
    let backend = Arc::new(MockBackend::new("mock", &["h1"]));
    let proxy = proxy(backend.clone());

    let response = route(
        &proxy,
        request(
            Method::POST,
            "/mock/api/v1/query_range",
            "query=metric&start=100&end=150&step=10",
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.fetched_extents().len(), 1);
}

#[tokio::test]
async fn test_oversized_post_body_is_rejected() {
    let backend = Arc::new(MockBackend::new("mock", &["h1"]));
    let proxy = proxy(backend.clone());

    let mut form = b"query=metric&start=100&end=150&step=10&pad=".to_vec();
    form.resize(MAX_FORM_BYTES + 1, b'x');
    let req = Request::builder()
        .method(Method::POST)
        .uri("/mock/api/v1/query_range")
        .body(Full::new(Bytes::from(form)))
        .unwrap();

    let response = route(&proxy, req).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let doc: Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(doc["errorType"], "bad_data");
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_out_of_range_extent_is_bad_request() {
    let backend = Arc::new(MockBackend::new("mock", &["h1"]));
    let proxy = proxy(backend.clone());

    // the mock takes milliseconds verbatim, so this end cannot be step aligned
    let uri = format!(
        "/mock/api/v1/query_range?query=metric&start=0&end={}&step=10",
        i64::MAX - 5
    );
    let response = route(&proxy, request(Method::GET, &uri, "")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_instant_query() {
    let backend = Arc::new(MockBackend::new("mock", &["h1"]));
    let proxy = proxy(backend);

    let response = route(
        &proxy,
        request(Method::GET, "/mock/api/v1/query?query=metric&time=100", ""),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_of(response).await, Bytes::from("[100]"));
}

#[tokio::test]
async fn test_bad_request_renders_prometheus_error() {
    let backend = Arc::new(MockBackend::new("mock", &["h1"]));
    let proxy = proxy(backend.clone());

    let response = route(
        &proxy,
        request(Method::GET, "/mock/api/v1/query_range?query=metric&start=1", ""),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let doc: Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(doc["status"], "error");
    assert_eq!(doc["errorType"], "bad_data");
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_upstream_failure_is_bad_gateway() {
    let backend = Arc::new(MockBackend::new("mock", &["h1"]));
    backend.fail_host("h1");
    let proxy = proxy(backend);

    let response = route(&proxy, request(Method::GET, RANGE, "")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let doc: Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(doc["errorType"], "unavailable");
}

#[tokio::test]
async fn test_unknown_paths_and_methods() {
    let proxy = proxy(Arc::new(MockBackend::new("mock", &["h1"])));

    let unknown_backend = route(
        &proxy,
        request(Method::GET, "/other/api/v1/query_range?query=x", ""),
    )
    .await;
    assert_eq!(unknown_backend.status(), StatusCode::NOT_FOUND);

    let unknown_path = route(&proxy, request(Method::GET, "/mock/api/v1/labels", "")).await;
    assert_eq!(unknown_path.status(), StatusCode::NOT_FOUND);

    let wrong_method = route(&proxy, request(Method::DELETE, RANGE, "")).await;
    assert_eq!(wrong_method.status(), StatusCode::METHOD_NOT_ALLOWED);

    let health = route(&proxy, request(Method::GET, "/health", "")).await;
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_purge_invalidates() {
    let backend = Arc::new(MockBackend::new("mock", &["h1"]));
    let proxy = proxy(backend.clone());
    let purge = Method::from_bytes(b"PURGE").unwrap();

    route(&proxy, request(Method::GET, RANGE, "")).await;

    let response = route(&proxy, request(purge.clone(), RANGE, "")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: PurgeResponse = serde_json::from_slice(&body_of(response).await).unwrap();
    assert!(body.success);
    assert!(body.purged);
    assert_eq!(body.backend, "mock");

    let again = route(&proxy, request(purge, RANGE, "")).await;
    let body: PurgeResponse = serde_json::from_slice(&body_of(again).await).unwrap();
    assert!(!body.purged);

    let refetch = route(&proxy, request(Method::GET, RANGE, "")).await;
    assert_eq!(refetch.headers()[CACHE_STATUS_HEADER], "miss");
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn test_proxy_server_end_to_end() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = Arc::new(MockBackend::new("mock", &["h1"]));
    let server = ProxyServer::new(proxy(backend), addr);
    let handle = tokio::spawn(async move { server.start().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = reqwest::get(format!("http://{}{}", addr, RANGE)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[CACHE_STATUS_HEADER], "miss");

    handle.abort();
}
