//! HTTP front end
//!
//! Routes Prometheus API requests of the form
//! `/{backend}/api/v1/query_range` and `/{backend}/api/v1/query` through the
//! [`DeltaProxy`], and handles `PURGE` on the same paths to invalidate the
//! cached entity of a query.

use crate::error::{DeltaError, Result};
use crate::metrics_endpoint::{health_response, not_found_response, simple_response};
use crate::models::Timestamp;
use crate::prometheus::{render_error, API_PATH, QUERY, QUERY_RANGE};
use crate::proxy::DeltaProxy;
use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Response header reporting how the cache contributed
pub const CACHE_STATUS_HEADER: &str = "x-delta-cache";

const JSON: &str = "application/json";

/// Largest accepted form encoded POST body
pub const MAX_FORM_BYTES: usize = 1024 * 1024;

/// PURGE response body
#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub success: bool,
    pub purged: bool,
    pub backend: String,
    pub message: String,
}

/// A parsed API path
#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    backend: String,
    instant: bool,
}

impl Route {
    fn parse(path: &str) -> Option<Route> {
        let (backend, rest) = path.strip_prefix('/')?.split_once('/')?;
        if backend.is_empty() {
            return None;
        }
        let endpoint = format!("/{}", rest);
        let endpoint = endpoint.strip_prefix(API_PATH)?.trim_end_matches('/');
        let instant = match endpoint {
            QUERY_RANGE => false,
            QUERY => true,
            _ => return None,
        };
        Some(Route {
            backend: backend.to_string(),
            instant,
        })
    }
}

/// Decode form encoded pairs; later duplicates win
fn parse_params(query: Option<&str>, form: &[u8]) -> Result<HashMap<String, String>> {
    let mut url = Url::parse("http://delta-proxy/")
        .map_err(|e| DeltaError::InternalError(format!("base url: {}", e)))?;
    let mut params = HashMap::new();

    let form = std::str::from_utf8(form)
        .map_err(|_| DeltaError::MalformedQuery("request body is not valid UTF-8".to_string()))?;
    for encoded in [query.unwrap_or_default(), form] {
        if encoded.is_empty() {
            continue;
        }
        url.set_query(Some(encoded));
        for (key, value) in url.query_pairs() {
            params.insert(key.into_owned(), value.into_owned());
        }
    }
    Ok(params)
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

fn error_response(err: &DeltaError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    simple_response(status, JSON, render_error(err))
}

/// Handle one request against `proxy`
pub async fn route<B>(proxy: &DeltaProxy, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    if path == "/health" {
        return health_response();
    }
    let Some(target) = Route::parse(&path) else {
        return not_found_response();
    };

    let form = if parts.method == Method::POST {
        match Limited::new(body, MAX_FORM_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                let err = DeltaError::MalformedQuery(format!(
                    "request body exceeds {} bytes",
                    MAX_FORM_BYTES
                ));
                return simple_response(StatusCode::PAYLOAD_TOO_LARGE, JSON, render_error(&err));
            }
            Err(e) => {
                return error_response(&DeltaError::HttpError(format!(
                    "failed to read request body: {}",
                    e
                )))
            }
        }
    } else {
        Bytes::new()
    };

    let params = match parse_params(parts.uri.query(), &form) {
        Ok(params) => params,
        Err(e) => return error_response(&e),
    };

    debug!("{} {} backend={}", parts.method, path, target.backend);
    match parts.method.as_str() {
        "GET" | "POST" => serve_query(proxy, &target, &params).await,
        "PURGE" => purge(proxy, &target, &params).await,
        _ => simple_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "405 Method Not Allowed",
        ),
    }
}

async fn serve_query(
    proxy: &DeltaProxy,
    route: &Route,
    params: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let backend = match proxy.backend(&route.backend) {
        Ok(backend) => backend,
        Err(_) => return not_found_response(),
    };
    let query = match backend.parse_query(params, route.instant) {
        Ok(query) => query,
        Err(e) => return error_response(&e),
    };

    let response = match proxy.execute(backend.clone(), query, now_ms()).await {
        Ok(response) => response,
        Err(e) => return error_response(&e),
    };
    let body = match backend.render(&response.dataset, route.instant) {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    let mut http_response = simple_response(StatusCode::OK, JSON, body);
    http_response.headers_mut().insert(
        CACHE_STATUS_HEADER,
        HeaderValue::from_static(response.status.as_str()),
    );
    http_response
}

async fn purge(
    proxy: &DeltaProxy,
    route: &Route,
    params: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let backend = match proxy.backend(&route.backend) {
        Ok(backend) => backend,
        Err(_) => return not_found_response(),
    };
    let query = match backend.parse_query(params, route.instant) {
        Ok(query) => query,
        Err(e) => return error_response(&e),
    };
    let query = match query.aligned() {
        Ok(query) => query,
        Err(e) => return error_response(&e),
    };

    let body = match proxy.invalidate(&route.backend, &query).await {
        Ok(purged) => PurgeResponse {
            success: true,
            purged,
            backend: route.backend.clone(),
            message: if purged {
                "cache entry purged".to_string()
            } else {
                "no cache entry found".to_string()
            },
        },
        Err(e) => return error_response(&e),
    };

    match serde_json::to_vec(&body) {
        Ok(json) => simple_response(StatusCode::OK, JSON, json),
        Err(e) => error_response(&DeltaError::InternalError(e.to_string())),
    }
}

/// HTTP server in front of a [`DeltaProxy`]
pub struct ProxyServer {
    proxy: DeltaProxy,
    addr: SocketAddr,
}

impl ProxyServer {
    pub fn new(proxy: DeltaProxy, addr: SocketAddr) -> Self {
        Self { proxy, addr }
    }

    /// Accept connections until the process exits
    pub async fn start(self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Delta proxy listening on http://{}", self.addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let proxy = self.proxy.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let proxy = proxy.clone();
                    async move { Ok::<_, hyper::Error>(route(&proxy, req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection from {}: {:?}", peer, err);
                }
            });
        }
    }
}
