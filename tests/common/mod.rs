//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use delta_proxy::{
    Backend, CacheStore, Dataset, DeltaError, Extent, Point, Result, Series, SeriesHeader,
    TimeRangeQuery,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Backend producing one point per step for series `{label="a"}`
pub struct MockBackend {
    name: String,
    hosts: Vec<String>,
    tolerance: Duration,
    failing_hosts: Mutex<HashSet<String>>,
    delay: Duration,
    fast_forward: bool,
    calls: Mutex<Vec<(String, Extent)>>,
}

impl MockBackend {
    pub fn new(name: &str, hosts: &[&str]) -> Self {
        MockBackend {
            name: name.to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            tolerance: Duration::from_millis(60),
            failing_hosts: Mutex::new(HashSet::new()),
            delay: Duration::ZERO,
            fast_forward: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_fast_forward(mut self) -> Self {
        self.fast_forward = true;
        self
    }

    pub fn fail_host(&self, host: &str) {
        self.failing_hosts.lock().unwrap().insert(host.to_string());
    }

    pub fn heal(&self) {
        self.failing_hosts.lock().unwrap().clear();
    }

    /// Every (host, extent) fetched so far, in call order
    pub fn calls(&self) -> Vec<(String, Extent)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetched_extents(&self) -> Vec<Extent> {
        let mut extents: Vec<Extent> = self.calls().into_iter().map(|(_, e)| e).collect();
        extents.sort_by_key(|e| (e.start, e.end));
        extents.dedup();
        extents
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

pub fn series_a(timestamps: impl IntoIterator<Item = i64>) -> Series {
    let labels = BTreeMap::from([("label".to_string(), "a".to_string())]);
    Series::new(
        SeriesHeader::new("metric", labels),
        timestamps
            .into_iter()
            .map(|t| Point::new(t, t as f64))
            .collect(),
    )
}

pub fn timestamps(dataset: &Dataset) -> Vec<i64> {
    dataset
        .series
        .iter()
        .flat_map(|s| s.points.iter().map(|p| p.timestamp))
        .collect()
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn default_backfill_tolerance(&self) -> Duration {
        self.tolerance
    }

    fn supports_fast_forward(&self) -> bool {
        self.fast_forward
    }

    fn parse_query(&self, params: &HashMap<String, String>, instant: bool) -> Result<TimeRangeQuery> {
        let get = |k: &str| -> Result<i64> {
            params
                .get(k)
                .ok_or_else(|| DeltaError::MalformedQuery(format!("missing {}", k)))?
                .parse()
                .map_err(|_| DeltaError::MalformedQuery(format!("bad {}", k)))
        };
        let statement = params.get("query").cloned().unwrap_or_default();
        let query = if instant {
            TimeRangeQuery::new(statement, Extent::instant(get("time")?), Duration::ZERO)
        } else {
            TimeRangeQuery::new(
                statement,
                Extent { start: get("start")?, end: get("end")? },
                Duration::from_millis(get("step")? as u64),
            )
        };
        let query = query.with_backfill_tolerance(self.tolerance);
        query.validate()?;
        Ok(query)
    }

    async fn fetch(&self, host: &str, query: &TimeRangeQuery) -> Result<Dataset> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), query.extent));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing_hosts.lock().unwrap().contains(host) {
            return Err(DeltaError::from_http_status(503, format!("{} unavailable", host)));
        }

        let extent = query.extent;
        let series = if extent.is_instant() {
            series_a([extent.start])
        } else {
            let step = query.step_ms().max(1) as usize;
            series_a((extent.start..extent.end).step_by(step))
        };
        Ok(Dataset::new(vec![series]))
    }

    fn render(&self, dataset: &Dataset, _instant: bool) -> Result<Bytes> {
        Ok(Bytes::from(format!("{:?}", timestamps(dataset))))
    }
}

/// Store whose every operation fails
pub struct UnavailableStore;

#[async_trait]
impl CacheStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
        Err(DeltaError::CacheUnavailable("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
        Err(DeltaError::CacheUnavailable("connection refused".to_string()))
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Err(DeltaError::CacheUnavailable("connection refused".to_string()))
    }

    async fn remove(&self, _key: &str) -> Result<bool> {
        Err(DeltaError::CacheUnavailable("connection refused".to_string()))
    }
}
