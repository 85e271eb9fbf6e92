//! Integration tests for the metrics endpoint
//!
//! These tests verify that the metrics HTTP endpoint exposes the proxy
//! counters and the upstream collectors in Prometheus format.

use delta_proxy::{CacheStatus, DeltaMetrics, MetricsEndpoint, UpstreamMetrics};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn free_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn test_metrics_endpoint_serves_metrics() {
    let metrics = Arc::new(DeltaMetrics::new());
    metrics.record_request(CacheStatus::Hit);
    metrics.record_request(CacheStatus::PartialHit);
    metrics.record_request(CacheStatus::Miss);
    metrics.record_fetch(true, Duration::from_millis(12));
    metrics.record_collapsed_wait();

    let registry = Registry::new();
    let upstream = UpstreamMetrics::with_registry(&registry).unwrap();
    upstream.observe("prom", true, Duration::from_millis(12));

    let addr = free_addr().await;
    let endpoint = MetricsEndpoint::new(Arc::clone(&metrics), registry, addr);
    let handle = tokio::spawn(async move { endpoint.start().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let body = reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("delta_proxy_requests_total 3"));
    assert!(body.contains("delta_proxy_cache_hits_total 1"));
    assert!(body.contains("delta_proxy_cache_partial_hits_total 1"));
    assert!(body.contains("delta_proxy_cache_misses_total 1"));
    assert!(body.contains("delta_proxy_collapsed_waits_total 1"));
    assert!(body.contains("delta_proxy_upstream_fetches_total{backend=\"prom\",result=\"success\"} 1"));
    assert!(body.contains("delta_proxy_upstream_fetch_duration_seconds_bucket"));

    handle.abort();
}

#[tokio::test]
async fn test_metrics_endpoint_health_and_not_found() {
    let addr = free_addr().await;
    let endpoint = MetricsEndpoint::new(Arc::new(DeltaMetrics::new()), Registry::new(), addr);
    let handle = tokio::spawn(async move { endpoint.start().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let health = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(health.status(), 200);
    assert!(health.text().await.unwrap().contains("healthy"));

    let missing = reqwest::get(format!("http://{}/nope", addr)).await.unwrap();
    assert_eq!(missing.status(), 404);

    handle.abort();
}
