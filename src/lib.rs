//! Delta Proxy
//!
//! A caching reverse proxy for time series query backends that speaks the
//! Prometheus HTTP API. Repeated dashboard queries over sliding time windows
//! are answered from cache, and only the missing time ranges (the "delta")
//! are fetched from upstream.
//!
//! # Overview
//!
//! Every query is identified by its statement, step, offset flag and
//! injected labels; the requested time range is not part of the identity.
//! For each identity the cache keeps one entity: the contiguous extent that
//! is known to be complete, plus the series data inside it. A request is
//! answered by computing which parts of the requested extent are not known,
//! fetching only those gaps, merging the result with the cached data and
//! writing the cacheable part back.
//!
//! # Features
//!
//! - **Delta Fetching**: Only uncovered gaps are sent upstream
//! - **Backfill Tolerance**: The most recent window is always refetched and never cached as complete
//! - **Fast Forward**: Range queries reaching "now" also carry the live value at "now"
//! - **Request Collapsing**: Concurrent identical gap fetches share one upstream request
//! - **Scatter/Gather**: Each fetch fans out to every host of a backend and the results are merged
//! - **Graceful Degradation**: Failed gaps or hosts reduce the answer instead of failing it
//! - **Hot Reload**: Backends can be reconfigured without dropping in-flight requests
//! - **Metrics Collection**: Atomic counters plus Prometheus collectors for upstream fetches
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use delta_proxy::{DeltaConfig, DeltaProxy, MemoryStore};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeltaConfig::from_file("delta_proxy.yaml")?;
//! let proxy = DeltaProxy::from_config(&config, Arc::new(MemoryStore::new()))?;
//!
//! let stats = proxy.metrics().get_stats();
//! println!("Total requests: {}", stats.total_requests);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`DeltaProxy`]: Orchestrates cache lookup, delta computation, fetching, merging and write-back
//! - [`compute_delta`]: Splits a requested extent into covered and to-fetch parts
//! - [`Dataset`]: Series data with the copy-on-write merge engine
//! - [`RequestCollapser`]: Single-flight execution keyed by query identity and gap
//! - [`scatter_fetch`]: Concurrent fan-out to the hosts of one backend
//! - [`Backend`]: Capability every upstream provider implements
//! - [`PrometheusBackend`]: The Prometheus provider
//! - [`CacheStore`]: Storage the cached entities live in
//! - [`DeltaMetrics`]: Runtime counters
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "127.0.0.1:8480"
//! log_level: info
//! cache:
//!   ttl_secs: 86400
//!   max_size_bytes: 536870912
//! max_concurrent_fetches: 4
//! max_retries: 2
//! request_timeout_ms: 30000
//! backends:
//!   prom:
//!     provider: prometheus
//!     hosts: ["http://prometheus-a:9090", "http://prometheus-b:9090"]
//!     backfill_tolerance_secs: 60
//!     labels:
//!       cluster: eu-1
//! metrics_endpoint:
//!   enabled: true
//!   address: "127.0.0.1:9091"
//! ```

pub mod backend;
pub mod backfill;
pub mod codec;
pub mod collapse;
pub mod config;
pub mod delta;
pub mod error;
pub mod gather;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod prometheus;
pub mod proxy;
pub mod series;
pub mod server;
pub mod store;
pub mod upstream;

pub use backend::Backend;
pub use backfill::{extract_tolerance_directive, BackfillPolicy};
pub use codec::CachedEntity;
pub use collapse::{CollapseRole, KeyLocks, RequestCollapser};
pub use config::{BackendConfig, CacheConfig, ConfigChanges, DeltaConfig, MetricsEndpointConfig};
pub use delta::{coalesce, compute_delta, Delta};
pub use error::{DeltaError, Result};
pub use gather::{gather_merge, scatter_fetch, Gathered};
pub use metrics::{CacheStatus, DeltaMetrics, MetricsSnapshot, UpstreamMetrics};
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{Extent, TimeRangeQuery, Timestamp};
pub use prometheus::PrometheusBackend;
pub use proxy::{cache_key, BackendRegistry, DeltaProxy, DeltaResponse};
pub use series::{Dataset, Point, Series, SeriesHash, SeriesHeader, SeriesLookupKey, ValueKind};
pub use server::ProxyServer;
pub use store::{CacheStore, MemoryStore, StoreStats};
pub use upstream::{RetryPolicy, UpstreamClient};
