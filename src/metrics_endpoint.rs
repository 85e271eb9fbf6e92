//! Metrics HTTP Endpoint
//!
//! Serves the proxy counters and the upstream `prometheus` collectors in
//! Prometheus text format at `/metrics`, plus a `/health` probe.

use crate::metrics::{DeltaMetrics, MetricsSnapshot};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Build a response with a fixed content type
pub(crate) fn simple_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

pub(crate) fn health_response() -> Response<Full<Bytes>> {
    simple_response(StatusCode::OK, "application/json", r#"{"status":"healthy"}"#)
}

pub(crate) fn not_found_response() -> Response<Full<Bytes>> {
    simple_response(StatusCode::NOT_FOUND, "text/plain", "404 Not Found")
}

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<DeltaMetrics>,
    registry: Registry,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Arguments
    /// * `metrics` - Shared counters of the proxy
    /// * `registry` - Registry holding the upstream collectors
    /// * `addr` - Address to bind the HTTP server to
    pub fn new(metrics: Arc<DeltaMetrics>, registry: Registry, addr: SocketAddr) -> Self {
        Self {
            metrics,
            registry,
            addr,
        }
    }

    /// Start the metrics endpoint server; runs until the process exits
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint listening on http://{}/metrics", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);
            let registry = self.registry.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    let registry = registry.clone();
                    async move { handle_request(req, metrics, registry).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<DeltaMetrics>,
    registry: Registry,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match req.uri().path() {
        "/metrics" => Ok(metrics_response(&metrics, &registry)),
        "/health" => Ok(health_response()),
        _ => Ok(not_found_response()),
    }
}

fn metrics_response(metrics: &DeltaMetrics, registry: &Registry) -> Response<Full<Bytes>> {
    let mut body = format_prometheus_metrics(&metrics.get_stats());

    let mut encoded = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut encoded) {
        Ok(()) => body.push_str(&String::from_utf8_lossy(&encoded)),
        Err(e) => warn!("Failed to encode upstream metrics: {}", e),
    }

    simple_response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP delta_proxy_{} {}", name, help);
    let _ = writeln!(out, "# TYPE delta_proxy_{} {}", name, kind);
    let _ = writeln!(out, "delta_proxy_{} {}\n", name, value);
}

/// Format the counters in Prometheus exposition format
fn format_prometheus_metrics(s: &MetricsSnapshot) -> String {
    let mut out = String::new();

    metric(&mut out, "requests_total", "counter", "Total number of query requests", s.total_requests);
    metric(&mut out, "failed_requests_total", "counter", "Requests that could not be answered", s.failed_requests);

    metric(&mut out, "cache_hits_total", "counter", "Requests served entirely from cache", s.cache_hits);
    metric(&mut out, "cache_partial_hits_total", "counter", "Requests served partly from cache", s.cache_partial_hits);
    metric(&mut out, "cache_misses_total", "counter", "Requests with no usable cached data", s.cache_misses);
    metric(&mut out, "cache_errors_total", "counter", "Cache store read or write failures", s.cache_errors);
    metric(&mut out, "cache_hit_rate", "gauge", "Full cache hit rate percentage", format!("{:.2}", s.cache_hit_rate()));
    metric(&mut out, "cache_write_backs_total", "counter", "Cached entities written back", s.write_backs);
    metric(&mut out, "cache_invalidations_total", "counter", "Cached entities purged", s.invalidations);

    metric(&mut out, "upstream_gap_fetches_total", "counter", "Gap fetches sent upstream", s.upstream_fetches);
    metric(&mut out, "upstream_failed_gap_fetches_total", "counter", "Gap fetches where every host failed", s.failed_fetches);
    metric(&mut out, "upstream_fetch_failure_rate", "gauge", "Gap fetch failure rate percentage", format!("{:.2}", s.fetch_failure_rate()));
    metric(&mut out, "collapsed_waits_total", "counter", "Callers that shared an in-flight fetch", s.collapsed_waits);
    metric(&mut out, "merge_ambiguities_total", "counter", "Series hash collisions seen while merging", s.merge_ambiguities);

    metric(&mut out, "points_served_total", "counter", "Data points returned to clients", s.points_served);
    metric(&mut out, "request_duration_ms_avg", "gauge", "Average request duration in milliseconds", format!("{:.2}", s.avg_request_duration_ms()));
    metric(&mut out, "fetch_duration_ms_avg", "gauge", "Average gap fetch duration in milliseconds", format!("{:.2}", s.avg_fetch_duration_ms()));

    out
}
