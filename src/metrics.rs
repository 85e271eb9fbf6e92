//! Metrics collection for the delta proxy
//!
//! [`DeltaMetrics`] is a set of lock-free atomic counters updated on the
//! request path. [`UpstreamMetrics`] holds `prometheus` collectors for
//! upstream fetch latency and outcomes, registered on a caller supplied
//! registry.

use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How a request was served relative to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Everything came from cache
    Hit,
    /// Part came from cache, the rest was fetched
    PartialHit,
    /// Nothing usable was cached
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::PartialHit => "partial-hit",
            CacheStatus::Miss => "miss",
        }
    }
}

/// Metrics collector for the delta proxy
///
/// All operations are thread-safe using atomic operations.
#[derive(Debug, Default)]
pub struct DeltaMetrics {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,

    cache_hits: AtomicU64,
    cache_partial_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
    write_backs: AtomicU64,
    invalidations: AtomicU64,

    upstream_fetches: AtomicU64,
    failed_fetches: AtomicU64,
    collapsed_waits: AtomicU64,
    merge_ambiguities: AtomicU64,

    points_served: AtomicU64,

    // stored as microseconds
    total_request_duration_us: AtomicU64,
    total_fetch_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,

    pub cache_hits: u64,
    pub cache_partial_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub write_backs: u64,
    pub invalidations: u64,

    pub upstream_fetches: u64,
    pub failed_fetches: u64,
    pub collapsed_waits: u64,
    pub merge_ambiguities: u64,

    pub points_served: u64,

    pub total_request_duration_us: u64,
    pub total_fetch_duration_us: u64,
}

impl DeltaMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a served request and how the cache contributed
    pub fn record_request(&self, status: CacheStatus) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            CacheStatus::Hit => &self.cache_hits,
            CacheStatus::PartialHit => &self.cache_partial_hits,
            CacheStatus::Miss => &self.cache_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that failed outright
    pub fn record_failed_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache store read or write failure
    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_back(&self) {
        self.write_backs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a gap fetch led by this process
    ///
    /// # Arguments
    /// * `success` - Whether at least one host answered
    /// * `duration` - Time spent on the fetch
    pub fn record_fetch(&self, success: bool, duration: Duration) {
        self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_fetches.fetch_add(1, Ordering::Relaxed);
        }
        self.total_fetch_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a caller that waited on another caller's in-flight fetch
    pub fn record_collapsed_wait(&self) {
        self.collapsed_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge_ambiguities(&self, count: usize) {
        self.merge_ambiguities.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_points_served(&self, points: usize) {
        self.points_served.fetch_add(points as u64, Ordering::Relaxed);
    }

    pub fn record_request_duration(&self, duration: Duration) {
        self.total_request_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded independently, so a snapshot taken under load may
    /// not be perfectly consistent across fields.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_partial_hits: self.cache_partial_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            upstream_fetches: self.upstream_fetches.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
            collapsed_waits: self.collapsed_waits.load(Ordering::Relaxed),
            merge_ambiguities: self.merge_ambiguities.load(Ordering::Relaxed),
            points_served: self.points_served.load(Ordering::Relaxed),
            total_request_duration_us: self.total_request_duration_us.load(Ordering::Relaxed),
            total_fetch_duration_us: self.total_fetch_duration_us.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    fn served(&self) -> u64 {
        self.cache_hits + self.cache_partial_hits + self.cache_misses
    }

    /// Full cache hits as a percentage of served requests (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        percentage(self.cache_hits, self.served())
    }

    /// Partial hits as a percentage of served requests (0.0 to 100.0)
    pub fn partial_hit_rate(&self) -> f64 {
        percentage(self.cache_partial_hits, self.served())
    }

    /// Failed gap fetches as a percentage of all fetches (0.0 to 100.0)
    pub fn fetch_failure_rate(&self) -> f64 {
        percentage(self.failed_fetches, self.upstream_fetches)
    }

    pub fn avg_request_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_request_duration_us as f64 / self.total_requests as f64) / 1000.0
        }
    }

    pub fn avg_fetch_duration_ms(&self) -> f64 {
        if self.upstream_fetches == 0 {
            0.0
        } else {
            (self.total_fetch_duration_us as f64 / self.upstream_fetches as f64) / 1000.0
        }
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}

/// Prometheus collectors for upstream fetches, labelled by backend
#[derive(Clone)]
pub struct UpstreamMetrics {
    /// Fetch outcomes by backend and result (success/failure)
    pub fetches_total: CounterVec,
    /// Fetch latency by backend
    pub fetch_duration_seconds: HistogramVec,
}

impl UpstreamMetrics {
    /// Create the collectors and register them on `registry`
    pub fn with_registry(registry: &Registry) -> Result<Self, prometheus::Error> {
        let fetches_total = CounterVec::new(
            Opts::new(
                "delta_proxy_upstream_fetches_total",
                "Total number of upstream gap fetches by result",
            ),
            &["backend", "result"],
        )?;
        registry.register(Box::new(fetches_total.clone()))?;

        let fetch_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "delta_proxy_upstream_fetch_duration_seconds",
                "Duration of upstream gap fetches in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["backend"],
        )?;
        registry.register(Box::new(fetch_duration_seconds.clone()))?;

        Ok(Self {
            fetches_total,
            fetch_duration_seconds,
        })
    }

    pub fn observe(&self, backend: &str, success: bool, duration: Duration) {
        let result = if success { "success" } else { "failure" };
        self.fetches_total.with_label_values(&[backend, result]).inc();
        self.fetch_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_record_requests() {
        let metrics = DeltaMetrics::new();
        metrics.record_request(CacheStatus::Hit);
        metrics.record_request(CacheStatus::Hit);
        metrics.record_request(CacheStatus::PartialHit);
        metrics.record_request(CacheStatus::Miss);
        metrics.record_failed_request();

        let stats = metrics.get_stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.cache_hit_rate(), 50.0);
        assert_eq!(stats.partial_hit_rate(), 25.0);
    }

    #[test]
    fn test_fetch_failure_rate() {
        let metrics = DeltaMetrics::new();
        metrics.record_fetch(true, Duration::from_millis(10));
        metrics.record_fetch(false, Duration::from_millis(30));

        let stats = metrics.get_stats();
        assert_eq!(stats.fetch_failure_rate(), 50.0);
        assert_eq!(stats.avg_fetch_duration_ms(), 20.0);
    }

    #[test]
    fn test_rates_with_no_operations() {
        let stats = DeltaMetrics::new().get_stats();
        assert_eq!(stats.cache_hit_rate(), 0.0);
        assert_eq!(stats.fetch_failure_rate(), 0.0);
        assert_eq!(stats.avg_request_duration_ms(), 0.0);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(DeltaMetrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let metrics = Arc::clone(&metrics);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    metrics.record_request(CacheStatus::Miss);
                    metrics.record_collapsed_wait();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = metrics.get_stats();
        assert_eq!(stats.total_requests, 1000);
        assert_eq!(stats.collapsed_waits, 1000);
    }

    #[test]
    fn test_upstream_metrics_registry() {
        let registry = Registry::new();
        let upstream = UpstreamMetrics::with_registry(&registry).unwrap();
        upstream.observe("prom", true, Duration::from_millis(20));
        upstream.observe("prom", false, Duration::from_millis(40));

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"delta_proxy_upstream_fetches_total".to_string()));
        assert!(names.contains(&"delta_proxy_upstream_fetch_duration_seconds".to_string()));
        assert_eq!(
            upstream.fetches_total.with_label_values(&["prom", "failure"]).get(),
            1.0
        );

        // registering twice on one registry is rejected
        assert!(UpstreamMetrics::with_registry(&registry).is_err());
    }
}
