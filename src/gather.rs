//! Scatter/gather across the hosts of one backend
//!
//! A query is dispatched to every host concurrently (bounded by a semaphore)
//! and the independent responses are folded left to right with the dataset
//! merge engine. Partial host failure is not fatal.

use crate::backend::Backend;
use crate::error::{DeltaError, Result};
use crate::models::TimeRangeQuery;
use crate::series::Dataset;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Merged result of a fan-out
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Gathered {
    pub dataset: Dataset,
    /// Hosts whose response was dropped, with the reason
    pub failed_hosts: Vec<(String, DeltaError)>,
    /// Series hash collisions seen while merging host responses
    pub ambiguities: Vec<DeltaError>,
}

/// Merge per-host results in the order given
///
/// Fails with `AllUpstreamsFailed` only when no host produced a dataset.
pub fn gather_merge(results: Vec<(String, Result<Dataset>)>) -> Result<Gathered> {
    let attempts = results.len();
    let mut merged: Option<Dataset> = None;
    let mut failed_hosts = Vec::new();
    let mut ambiguities = Vec::new();

    for (host, result) in results {
        match result {
            Ok(dataset) => {
                merged = Some(match merged {
                    None => dataset,
                    Some(acc) => {
                        let (next, collisions) = acc.merge_with_report(&dataset);
                        ambiguities.extend(collisions);
                        next
                    }
                });
            }
            Err(e) => {
                warn!("Upstream host failed: host={}, error={}", host, e);
                failed_hosts.push((host, e));
            }
        }
    }

    match merged {
        Some(dataset) => Ok(Gathered {
            dataset,
            failed_hosts,
            ambiguities,
        }),
        None => {
            let last_error = failed_hosts
                .last()
                .map(|(host, e)| format!("{}: {}", host, e))
                .unwrap_or_else(|| "no upstream hosts configured".to_string());
            Err(DeltaError::AllUpstreamsFailed { attempts, last_error })
        }
    }
}

/// Fetch `query` from every host of `backend` and merge the responses
///
/// # Arguments
/// * `backend` - The backend whose hosts are queried
/// * `query` - The query, already restricted to the extent to fetch
/// * `max_concurrent` - Upper bound on simultaneous host requests
pub async fn scatter_fetch(
    backend: Arc<dyn Backend>,
    query: &TimeRangeQuery,
    max_concurrent: usize,
) -> Result<Gathered> {
    let hosts = backend.hosts().to_vec();
    debug!(
        "Scattering query to {} hosts: backend={}, extent={}",
        hosts.len(),
        backend.name(),
        query.extent
    );

    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut tasks = Vec::with_capacity(hosts.len());

    for host in hosts {
        let sem = Arc::clone(&semaphore);
        let backend = Arc::clone(&backend);
        let query = query.clone();
        let task_host = host.clone();

        let task = tokio::spawn(async move {
            let _permit = sem
                .acquire()
                .await
                .map_err(|e| DeltaError::InternalError(format!("semaphore closed: {}", e)))?;
            backend.fetch(&task_host, &query).await
        });
        tasks.push((host, task));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for (host, task) in tasks {
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(DeltaError::InternalError(format!("fetch task failed: {}", e))),
        };
        let result = result.map_err(|e| match e {
            DeltaError::UpstreamFetchFailed { .. } => e,
            other => DeltaError::UpstreamFetchFailed {
                host: host.clone(),
                message: other.to_string(),
            },
        });
        results.push((host, result));
    }

    gather_merge(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::{Point, Series, SeriesHeader};
    use std::collections::BTreeMap;

    fn dataset(label: &str, points: &[(i64, f64)]) -> Dataset {
        let mut labels = BTreeMap::new();
        labels.insert("label".to_string(), label.to_string());
        Dataset::new(vec![Series::new(
            SeriesHeader::new("", labels),
            points.iter().map(|&(t, v)| Point::new(t, v)).collect(),
        )])
    }

    #[test]
    fn test_merges_left_to_right() {
        let gathered = gather_merge(vec![
            ("h1".to_string(), Ok(dataset("a", &[(10, 1.0), (20, 1.0)]))),
            ("h2".to_string(), Ok(dataset("a", &[(20, 2.0)]))),
            ("h3".to_string(), Ok(dataset("b", &[(10, 3.0)]))),
        ])
        .unwrap();
        assert_eq!(gathered.dataset.series.len(), 2);
        assert_eq!(gathered.dataset.series[0].points[1].value, 2.0);
        assert!(gathered.failed_hosts.is_empty());
    }

    #[test]
    fn test_partial_failure_reports_hosts() {
        let gathered = gather_merge(vec![
            ("h1".to_string(), Err(DeltaError::Timeout("slow".into()))),
            ("h2".to_string(), Ok(dataset("a", &[(10, 1.0)]))),
        ])
        .unwrap();
        assert_eq!(gathered.dataset.point_count(), 1);
        assert_eq!(gathered.failed_hosts.len(), 1);
        assert_eq!(gathered.failed_hosts[0].0, "h1");
    }

    #[test]
    fn test_all_failed() {
        let err = gather_merge(vec![
            ("h1".to_string(), Err(DeltaError::Timeout("slow".into()))),
            ("h2".to_string(), Err(DeltaError::from_http_status(503, "down"))),
        ])
        .unwrap_err();
        match err {
            DeltaError::AllUpstreamsFailed { attempts, last_error } => {
                assert_eq!(attempts, 2);
                assert!(last_error.starts_with("h2"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_no_hosts() {
        assert!(matches!(
            gather_merge(Vec::new()),
            Err(DeltaError::AllUpstreamsFailed { attempts: 0, .. })
        ));
    }
}
