//! Delta proxy orchestrator
//!
//! [`DeltaProxy`] serves one time range query at a time through the
//! following states:
//!
//! 1. resolve the cache key (extent independent)
//! 2. read the cached entity; a miss means nothing is known
//! 3. compute the delta against the backfill cutoff
//! 4. fetch every gap through the request collapser, fanning out to all
//!    hosts of the backend
//! 5. merge cached and fetched data in ascending extent order
//! 6. write the cacheable (pre-cutoff) part back under a per-key lock
//!
//! Fetch failures degrade to a partial answer. The request only fails when
//! the query is malformed or no data of any kind could be obtained.
//!
//! Range queries that reach "now" on a fast-forward capable backend also
//! fetch the instantaneous value at `now`. That point is served but never
//! written back.

use crate::backend::Backend;
use crate::backfill::BackfillPolicy;
use crate::codec::CachedEntity;
use crate::collapse::{CollapseRole, KeyLocks, RequestCollapser};
use crate::config::DeltaConfig;
use crate::delta::{coalesce, compute_delta, Delta};
use crate::error::{DeltaError, Result};
use crate::gather::{scatter_fetch, Gathered};
use crate::metrics::{CacheStatus, DeltaMetrics, UpstreamMetrics};
use crate::models::{Extent, TimeRangeQuery, Timestamp};
use crate::prometheus::PrometheusBackend;
use crate::series::Dataset;
use crate::store::CacheStore;
use crate::upstream::UpstreamClient;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

/// Backends available to the proxy, swapped as a whole on reload
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    max_concurrent_fetches: usize,
}

impl BackendRegistry {
    pub fn new(max_concurrent_fetches: usize) -> Self {
        BackendRegistry {
            backends: HashMap::new(),
            max_concurrent_fetches,
        }
    }

    /// Build every configured backend
    pub fn from_config(config: &DeltaConfig) -> Result<Self> {
        let client = UpstreamClient::new(config.request_timeout(), config.max_retries)?;
        let mut registry = BackendRegistry::new(config.max_concurrent_fetches);

        for (name, backend_config) in &config.backends {
            let backend: Arc<dyn Backend> = match backend_config.provider.as_str() {
                "prometheus" => Arc::new(PrometheusBackend::new(
                    name.clone(),
                    backend_config,
                    client.clone(),
                )),
                other => {
                    return Err(DeltaError::ConfigError(format!(
                        "backend '{}': unsupported provider '{}'",
                        name, other
                    )))
                }
            };
            registry.register(backend);
        }
        Ok(registry)
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_concurrent_fetches
    }
}

/// Outcome of one orchestrated query
#[derive(Debug, Clone)]
pub struct DeltaResponse {
    /// Merged data cropped to the (step aligned) requested extent
    pub dataset: Dataset,
    pub status: CacheStatus,
    /// The step aligned extent that was served
    pub extent: Extent,
    /// Gaps fetched successfully, ascending
    pub fetched: Vec<Extent>,
    /// Gaps that could not be fetched, ascending
    pub failed: Vec<(Extent, DeltaError)>,
    /// Hosts that failed while other hosts of the backend answered
    pub failed_hosts: Vec<String>,
    /// Known extent persisted by this request, if a write-back happened
    pub persisted: Option<Extent>,
    /// Timestamp of the fast-forward point merged into the dataset
    pub fast_forward: Option<Timestamp>,
}

/// Cache key of a query: backend name plus a hash of everything but the extent
pub fn cache_key(backend: &str, query: &TimeRangeQuery) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(query.statement.as_bytes());
    hasher.update(&[0]);
    hasher.update(&query.step_ms().to_le_bytes());
    hasher.update(&[query.is_offset as u8]);
    for (key, value) in &query.labels {
        hasher.update(key.as_bytes());
        hasher.update(&[0xff]);
        hasher.update(value.as_bytes());
        hasher.update(&[0]);
    }
    format!("{}:{:016x}", backend, hasher.digest())
}

/// The part of a fetched gap that may be recorded as known
fn cacheable_part(gap: &Extent, cutoff: Timestamp) -> Option<Extent> {
    if gap.is_instant() {
        (gap.start < cutoff).then_some(*gap)
    } else {
        let clamped = gap.clamp_end(cutoff);
        (!clamped.is_empty()).then_some(clamped)
    }
}

/// The delta proxy orchestrator
#[derive(Clone)]
pub struct DeltaProxy {
    store: Arc<dyn CacheStore>,
    registry: Arc<RwLock<Arc<BackendRegistry>>>,
    collapser: Arc<RequestCollapser<String, Gathered>>,
    write_locks: Arc<KeyLocks<String>>,
    metrics: Arc<DeltaMetrics>,
    upstream_metrics: Option<UpstreamMetrics>,
    cache_ttl: Duration,
}

impl DeltaProxy {
    /// Create a new DeltaProxy
    ///
    /// # Arguments
    /// * `store` - Where cached entities live
    /// * `registry` - Backends queries can be routed to
    /// * `cache_ttl` - TTL applied to every write-back
    pub fn new(store: Arc<dyn CacheStore>, registry: BackendRegistry, cache_ttl: Duration) -> Self {
        DeltaProxy {
            store,
            registry: Arc::new(RwLock::new(Arc::new(registry))),
            collapser: Arc::new(RequestCollapser::new()),
            write_locks: Arc::new(KeyLocks::new()),
            metrics: Arc::new(DeltaMetrics::new()),
            upstream_metrics: None,
            cache_ttl,
        }
    }

    /// Build the proxy and its backends from configuration
    pub fn from_config(config: &DeltaConfig, store: Arc<dyn CacheStore>) -> Result<Self> {
        let registry = BackendRegistry::from_config(config)?;
        Ok(Self::new(store, registry, config.cache_ttl()))
    }

    pub fn with_upstream_metrics(mut self, upstream_metrics: UpstreamMetrics) -> Self {
        self.upstream_metrics = Some(upstream_metrics);
        self
    }

    pub fn metrics(&self) -> &DeltaMetrics {
        &self.metrics
    }

    pub fn metrics_arc(&self) -> Arc<DeltaMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current registry snapshot; a request keeps the one it started with
    pub fn registry(&self) -> Arc<BackendRegistry> {
        let guard = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the backend registry; in-flight requests are unaffected
    pub fn swap_registry(&self, registry: BackendRegistry) {
        let mut guard = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(registry);
        info!("Backend registry swapped: backends={}", guard.len());
    }

    /// Rebuild backends from a freshly loaded configuration
    pub fn reload(&self, config: &DeltaConfig) -> Result<()> {
        let registry = BackendRegistry::from_config(config)?;
        self.swap_registry(registry);
        Ok(())
    }

    /// Look up a backend by name
    pub fn backend(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.registry()
            .get(name)
            .ok_or_else(|| DeltaError::MalformedQuery(format!("unknown backend '{}'", name)))
    }

    /// Serve `query` against the backend registered as `backend_name`
    pub async fn handle(
        &self,
        backend_name: &str,
        query: TimeRangeQuery,
        now: Timestamp,
    ) -> Result<DeltaResponse> {
        let backend = self.backend(backend_name)?;
        self.execute(backend, query, now).await
    }

    /// Serve `query` against `backend`
    ///
    /// `now` anchors the backfill cutoff; it is supplied by the caller so the
    /// outcome is deterministic for a given clock reading.
    pub async fn execute(
        &self,
        backend: Arc<dyn Backend>,
        query: TimeRangeQuery,
        now: Timestamp,
    ) -> Result<DeltaResponse> {
        let started = Instant::now();
        let result = self.execute_inner(backend, query, now).await;
        self.metrics.record_request_duration(started.elapsed());

        match &result {
            Ok(response) => {
                self.metrics.record_request(response.status);
                self.metrics.record_points_served(response.dataset.point_count());
            }
            Err(e) => {
                self.metrics.record_failed_request();
                warn!("Query failed: {}", e);
            }
        }
        result
    }

    async fn execute_inner(
        &self,
        backend: Arc<dyn Backend>,
        query: TimeRangeQuery,
        now: Timestamp,
    ) -> Result<DeltaResponse> {
        query.validate()?;

        let mut query = query.aligned()?;
        if query.backfill_tolerance.is_zero() {
            query.backfill_tolerance = backend.default_backfill_tolerance();
        }
        let requested = query.extent;
        let key = cache_key(backend.name(), &query);
        let cutoff = BackfillPolicy::new(query.backfill_tolerance).step_cutoff(now, query.step);

        let (cached, cache_available) = match self.read_entity(&key).await {
            Ok(entity) => (entity, true),
            Err(e) => {
                warn!("Cache unavailable, fetching everything: key={}, error={}", key, e);
                self.metrics.record_cache_error();
                (None, false)
            }
        };

        let delta = match &cached {
            Some(entity) => compute_delta(&requested, &entity.known_extent, cutoff),
            None => Delta::fetch_all(&requested),
        };
        let status = if delta.is_full_hit() {
            CacheStatus::Hit
        } else if delta.is_miss() {
            CacheStatus::Miss
        } else {
            CacheStatus::PartialHit
        };
        debug!(
            "Delta resolved: key={}, requested={}, cutoff={}, status={}, gaps={}",
            key,
            requested,
            cutoff,
            status.as_str(),
            delta.to_fetch.len()
        );

        let fast_forward = self.spawn_fast_forward(&backend, &key, &query, now);
        let (fetched, failed) = self.fetch_gaps(&backend, &key, &query, &delta).await;

        if fetched.is_empty() && !failed.is_empty() && delta.covered.is_empty() {
            let last_error = failed
                .last()
                .map(|(gap, e)| format!("{}: {}", gap, e))
                .unwrap_or_default();
            return Err(DeltaError::AllUpstreamsFailed {
                attempts: failed.len(),
                last_error,
            });
        }

        let base = cached.map(|entity| entity.dataset).unwrap_or_default();
        let mut merged = base;
        let mut ambiguities = 0;
        for (_, gathered) in &fetched {
            let (next, collisions) = merged.merge_with_report(&gathered.dataset);
            ambiguities += collisions.len() + gathered.ambiguities.len();
            merged = next;
        }
        if ambiguities > 0 {
            self.metrics.record_merge_ambiguities(ambiguities);
        }

        let fast_forward = match fast_forward {
            Some(task) => self.join_fast_forward(task, now).await,
            None => None,
        };
        let fast_forward_at = fast_forward.as_ref().map(|_| now);
        if let Some(gathered) = fast_forward {
            merged = merged.merge(&gathered.dataset);
        }

        let persisted = if cache_available {
            self.write_back(&key, &query, &fetched, cutoff, now).await
        } else {
            None
        };

        let failed_hosts = fetched
            .iter()
            .flat_map(|(_, g)| g.failed_hosts.iter().map(|(host, _)| host.clone()))
            .collect();

        let response = DeltaResponse {
            dataset: merged.crop(&requested),
            status,
            extent: requested,
            fetched: fetched.iter().map(|(gap, _)| *gap).collect(),
            failed,
            failed_hosts,
            persisted,
            fast_forward: fast_forward_at,
        };

        info!(
            "Query served: backend={}, extent={}, cache={}, fetched={}, failed={}, series={}, points={}",
            backend.name(),
            requested,
            status.as_str(),
            response.fetched.len(),
            response.failed.len(),
            response.dataset.series.len(),
            response.dataset.point_count()
        );
        Ok(response)
    }

    /// Start the fast-forward fetch when the query reaches `now`
    ///
    /// Only range queries on a capable backend whose aligned extent contains
    /// `now` off the step grid qualify; a grid point is already fetched as part
    /// of the uncacheable tail.
    fn spawn_fast_forward(
        &self,
        backend: &Arc<dyn Backend>,
        key: &str,
        query: &TimeRangeQuery,
        now: Timestamp,
    ) -> Option<JoinHandle<Result<Gathered>>> {
        if query.is_instant()
            || query.fast_forward_disable
            || !backend.supports_fast_forward()
            || !query.extent.contains(now)
            || now.rem_euclid(query.step_ms()) == 0
        {
            return None;
        }

        let at = Extent::instant(now);
        let instant = TimeRangeQuery {
            step: Duration::ZERO,
            ..query.with_extent(at)
        };
        let collapse_key = format!("{}|{}", key, at);
        let max_concurrent = self.registry().max_concurrent_fetches();
        let proxy = self.clone();
        let backend = Arc::clone(backend);
        debug!("Fast-forwarding range query: key={}, at={}", key, now);

        Some(tokio::spawn(async move {
            proxy
                .fetch_gap(backend, collapse_key, instant, max_concurrent)
                .await
        }))
    }

    /// Wait for the fast-forward fetch; a failure only drops the point
    async fn join_fast_forward(
        &self,
        task: JoinHandle<Result<Gathered>>,
        now: Timestamp,
    ) -> Option<Gathered> {
        let result = task
            .await
            .unwrap_or_else(|e| Err(DeltaError::InternalError(format!("fast-forward task failed: {}", e))));
        match result {
            Ok(gathered) => Some(gathered),
            Err(e) => {
                warn!("Fast-forward fetch failed, serving without it: at={}, error={}", now, e);
                None
            }
        }
    }

    /// Fetch every gap concurrently, returning results in ascending gap order
    async fn fetch_gaps(
        &self,
        backend: &Arc<dyn Backend>,
        key: &str,
        query: &TimeRangeQuery,
        delta: &Delta,
    ) -> (Vec<(Extent, Gathered)>, Vec<(Extent, DeltaError)>) {
        let max_concurrent = self.registry().max_concurrent_fetches();
        let mut tasks = Vec::with_capacity(delta.to_fetch.len());

        for gap in &delta.to_fetch {
            let proxy = self.clone();
            let backend = Arc::clone(backend);
            let collapse_key = format!("{}|{}", key, gap);
            let gap_query = query.with_extent(*gap);
            let task = tokio::spawn(async move {
                proxy
                    .fetch_gap(backend, collapse_key, gap_query, max_concurrent)
                    .await
            });
            tasks.push((*gap, task));
        }

        let mut fetched = Vec::new();
        let mut failed = Vec::new();
        for (gap, task) in tasks {
            let result = task
                .await
                .unwrap_or_else(|e| Err(DeltaError::InternalError(format!("gap task failed: {}", e))));
            match result {
                Ok(gathered) => fetched.push((gap, gathered)),
                Err(e) => {
                    warn!("Gap fetch failed, serving without it: gap={}, error={}", gap, e);
                    failed.push((gap, e));
                }
            }
        }
        (fetched, failed)
    }

    /// Fetch one gap, sharing the work with concurrent identical requests
    async fn fetch_gap(
        &self,
        backend: Arc<dyn Backend>,
        collapse_key: String,
        query: TimeRangeQuery,
        max_concurrent: usize,
    ) -> Result<Gathered> {
        let metrics = Arc::clone(&self.metrics);
        let upstream_metrics = self.upstream_metrics.clone();

        let (result, role) = self
            .collapser
            .execute_with_role(collapse_key, move || async move {
                let started = Instant::now();
                let result = scatter_fetch(Arc::clone(&backend), &query, max_concurrent).await;
                let elapsed = started.elapsed();
                metrics.record_fetch(result.is_ok(), elapsed);
                if let Some(upstream) = upstream_metrics {
                    upstream.observe(backend.name(), result.is_ok(), elapsed);
                }
                result
            })
            .await;

        if role == CollapseRole::Follower {
            self.metrics.record_collapsed_wait();
        }
        result
    }

    /// Read and decode the entity under `key`
    ///
    /// A corrupt entity is reported as a miss; only store failures are errors.
    async fn read_entity(&self, key: &str) -> Result<Option<CachedEntity>> {
        let bytes = self.store.get(key).await.map_err(|e| match e {
            DeltaError::CacheUnavailable(_) => e,
            other => DeltaError::CacheUnavailable(other.to_string()),
        })?;

        match bytes {
            None => Ok(None),
            Some(bytes) => match CachedEntity::decode(&bytes) {
                Ok(entity) => Ok(Some(entity)),
                Err(e) => {
                    warn!("Discarding undecodable cache entity: key={}, error={}", key, e);
                    Ok(None)
                }
            },
        }
    }

    /// Persist the cacheable part of what was fetched
    ///
    /// Runs under the per-key write lock and re-reads the entity inside it,
    /// so concurrent writers extending different gaps keep each other's data.
    async fn write_back(
        &self,
        key: &str,
        query: &TimeRangeQuery,
        fetched: &[(Extent, Gathered)],
        cutoff: Timestamp,
        now: Timestamp,
    ) -> Option<Extent> {
        let cacheable: Vec<(Extent, &Dataset)> = fetched
            .iter()
            .filter_map(|(gap, g)| cacheable_part(gap, cutoff).map(|part| (part, &g.dataset)))
            .collect();
        if cacheable.is_empty() {
            debug!("Nothing cacheable fetched, skipping write-back: key={}", key);
            return None;
        }

        let _guard = self.write_locks.lock(&key.to_string()).await;

        let current = match self.read_entity(key).await {
            Ok(entity) => entity,
            Err(e) => {
                warn!("Cache unavailable during write-back: key={}, error={}", key, e);
                self.metrics.record_cache_error();
                return None;
            }
        };

        let entity = if query.is_instant() {
            let (at, dataset) = cacheable[0];
            CachedEntity::new(at, now, dataset.crop(&at))
        } else {
            let mut extents: Vec<Extent> = cacheable.iter().map(|(part, _)| *part).collect();
            let mut dataset = Dataset::default();
            if let Some(current) = current.filter(|c| !c.known_extent.is_instant()) {
                extents.push(current.known_extent.clamp_end(cutoff));
                dataset = current.dataset;
            }
            for (_, fetched) in &cacheable {
                dataset = dataset.merge(fetched);
            }

            let runs = coalesce(extents);
            let known = match runs.iter().max_by_key(|run| run.end) {
                Some(run) => *run,
                None => return None,
            };
            if runs.len() > 1 {
                debug!(
                    "Known coverage not contiguous, keeping latest run: key={}, runs={}, kept={}",
                    key,
                    runs.len(),
                    known
                );
            }
            CachedEntity::new(known, now, dataset.crop(&known))
        };

        let encoded = match entity.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode cache entity: key={}, error={}", key, e);
                return None;
            }
        };

        match self.store.set(key, encoded, self.cache_ttl).await {
            Ok(()) => {
                self.metrics.record_write_back();
                debug!("Wrote back entity: key={}, known={}", key, entity.known_extent);
                Some(entity.known_extent)
            }
            Err(e) => {
                warn!("Cache write-back failed: key={}, error={}", key, e);
                self.metrics.record_cache_error();
                None
            }
        }
    }

    /// Drop the cached entity for `query`
    pub async fn invalidate(&self, backend_name: &str, query: &TimeRangeQuery) -> Result<bool> {
        let backend = self.backend(backend_name)?;
        let key = cache_key(backend.name(), query);
        let _guard = self.write_locks.lock(&key).await;
        let removed = self.store.remove(&key).await?;
        self.metrics.record_invalidation();
        info!("Invalidated cache entity: key={}, removed={}", key, removed);
        Ok(removed)
    }
}
