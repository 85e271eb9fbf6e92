//! Series identity and dataset merging
//!
//! Series are joined across datasets by a [`SeriesLookupKey`]: the index of
//! the statement that produced the series plus a 64-bit hash of its label
//! set. Merging never mutates its inputs; every merge yields a new dataset.

use crate::error::DeltaError;
use crate::models::{Extent, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use xxhash_rust::xxh3::Xxh3;

/// Bytes accounted per point by the size hint (timestamp + value)
pub const POINT_SIZE: usize = 16;

/// Order-independent 64-bit identity of a label set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesHash(pub u64);

impl SeriesHash {
    /// Hash a series name and its labels
    ///
    /// Labels are fed in key order (the map is sorted), so insertion order
    /// never changes the result.
    pub fn of(name: &str, labels: &BTreeMap<String, String>) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        for (key, value) in labels {
            hasher.update(key.as_bytes());
            hasher.update(&[0xff]);
            hasher.update(value.as_bytes());
            hasher.update(&[0]);
        }
        SeriesHash(hasher.digest())
    }
}

/// Join key for a series: the originating statement plus its label hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesLookupKey {
    pub statement_index: usize,
    pub hash: SeriesHash,
}

/// Kind of values carried by a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueKind {
    #[default]
    Float,
    Integer,
    Unknown,
}

/// Identifying metadata of a series
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeriesHeader {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value_kind: ValueKind,
    /// Index of the statement that produced this series (multi-statement queries)
    pub statement_index: usize,
}

impl SeriesHeader {
    pub fn new(name: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        SeriesHeader {
            name: name.into(),
            labels,
            ..Default::default()
        }
    }

    pub fn hash(&self) -> SeriesHash {
        SeriesHash::of(&self.name, &self.labels)
    }

    /// Same identity under a hash but different metadata means a collision
    fn conflicts_with(&self, other: &SeriesHeader) -> bool {
        self.name != other.name || self.labels != other.labels || self.value_kind != other.value_kind
    }

    fn size_hint(&self) -> usize {
        self.name.len()
            + self
                .labels
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A single sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Point {
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Point { timestamp, value }
    }
}

/// One labeled sequence of points, sorted by timestamp without duplicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub header: SeriesHeader,
    pub points: Vec<Point>,
    /// Cost hint used by cache size accounting
    pub point_size: usize,
}

impl Series {
    /// Build a series, sorting points and collapsing duplicate timestamps
    ///
    /// When a timestamp repeats, the later point in `points` wins.
    pub fn new(header: SeriesHeader, points: Vec<Point>) -> Self {
        let mut by_ts: BTreeMap<Timestamp, f64> = BTreeMap::new();
        for p in points {
            by_ts.insert(p.timestamp, p.value);
        }
        Self::from_sorted(header, by_ts)
    }

    fn from_sorted(header: SeriesHeader, by_ts: BTreeMap<Timestamp, f64>) -> Self {
        let points: Vec<Point> = by_ts.into_iter().map(|(t, v)| Point::new(t, v)).collect();
        let point_size = points.len() * POINT_SIZE + header.size_hint();
        Series { header, points, point_size }
    }

    pub fn lookup_key(&self) -> SeriesLookupKey {
        SeriesLookupKey {
            statement_index: self.header.statement_index,
            hash: self.header.hash(),
        }
    }

    /// Merge points of `incoming` into a copy of this series; incoming wins on conflict
    fn merged_with(&self, incoming: &Series) -> Series {
        let mut by_ts: BTreeMap<Timestamp, f64> =
            self.points.iter().map(|p| (p.timestamp, p.value)).collect();
        for p in &incoming.points {
            by_ts.insert(p.timestamp, p.value);
        }
        Series::from_sorted(incoming.header.clone(), by_ts)
    }

    fn cropped(&self, extent: &Extent) -> Series {
        let keep = |ts: Timestamp| {
            if extent.is_instant() {
                ts == extent.start
            } else {
                extent.contains(ts)
            }
        };
        let by_ts = self
            .points
            .iter()
            .filter(|p| keep(p.timestamp))
            .map(|p| (p.timestamp, p.value))
            .collect();
        Series::from_sorted(self.header.clone(), by_ts)
    }
}

/// The full result of one query: an ordered collection of series
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dataset {
    /// Number of statements the query consisted of
    pub statement_count: usize,
    pub series: Vec<Series>,
}

impl Dataset {
    pub fn new(series: Vec<Series>) -> Self {
        let statement_count = series
            .iter()
            .map(|s| s.header.statement_index + 1)
            .max()
            .unwrap_or(0);
        Dataset { statement_count, series }
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn point_count(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }

    pub fn size_hint(&self) -> usize {
        self.series.iter().map(|s| s.point_size).sum()
    }

    /// Merge `incoming` into a copy of this dataset
    ///
    /// Series are joined by lookup key. Matching series take the union of
    /// both point sets with `incoming` winning per timestamp; series only in
    /// `self` are kept untouched and new series are appended in arrival order.
    pub fn merge(&self, incoming: &Dataset) -> Dataset {
        self.merge_with_report(incoming).0
    }

    /// Like [`Dataset::merge`], also returning the hash collisions seen
    ///
    /// A collision (same key, different header) is logged as a
    /// `MergeAmbiguity` and resolved last-write-wins; nothing is done to
    /// separate the series.
    pub fn merge_with_report(&self, incoming: &Dataset) -> (Dataset, Vec<DeltaError>) {
        let mut out = self.series.clone();
        let mut index: HashMap<SeriesLookupKey, usize> = out
            .iter()
            .enumerate()
            .map(|(i, s)| (s.lookup_key(), i))
            .collect();
        let mut ambiguities = Vec::new();

        for series in &incoming.series {
            let key = series.lookup_key();
            match index.get(&key) {
                Some(&i) => {
                    if out[i].header.conflicts_with(&series.header) {
                        let ambiguity = DeltaError::MergeAmbiguity(format!(
                            "statement={}, hash={:016x}, cached={:?}, incoming={:?}",
                            key.statement_index, key.hash.0, out[i].header, series.header
                        ));
                        warn!("{}", ambiguity);
                        ambiguities.push(ambiguity);
                    }
                    out[i] = out[i].merged_with(series);
                }
                None => {
                    index.insert(key, out.len());
                    out.push(series.clone());
                }
            }
        }

        debug!(
            "Merged datasets: base_series={}, incoming_series={}, result_series={}",
            self.series.len(),
            incoming.series.len(),
            out.len()
        );

        let merged = Dataset {
            statement_count: self.statement_count.max(incoming.statement_count),
            series: out,
        };
        (merged, ambiguities)
    }

    /// Keep only points inside `extent`, dropping series left without points
    ///
    /// A zero-width extent keeps the points at exactly that instant.
    pub fn crop(&self, extent: &Extent) -> Dataset {
        let series = self
            .series
            .iter()
            .map(|s| s.cropped(extent))
            .filter(|s| !s.points.is_empty())
            .collect();
        Dataset {
            statement_count: self.statement_count,
            series,
        }
    }

    /// Attach `labels` to every series, overriding same-named labels
    pub fn with_labels(&self, labels: &BTreeMap<String, String>) -> Dataset {
        if labels.is_empty() {
            return self.clone();
        }
        let series = self
            .series
            .iter()
            .map(|s| {
                let mut header = s.header.clone();
                for (k, v) in labels {
                    header.labels.insert(k.clone(), v.clone());
                }
                Series::new(header, s.points.clone())
            })
            .collect();
        Dataset {
            statement_count: self.statement_count,
            series,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn series(label: &str, points: &[(i64, f64)]) -> Series {
        Series::new(
            SeriesHeader::new("", labels(&[("label", label)])),
            points.iter().map(|&(t, v)| Point::new(t, v)).collect(),
        )
    }

    #[test]
    fn test_hash_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("job".to_string(), "api".to_string());
        a.insert("instance".to_string(), "a:9090".to_string());
        let mut b = BTreeMap::new();
        b.insert("instance".to_string(), "a:9090".to_string());
        b.insert("job".to_string(), "api".to_string());
        assert_eq!(SeriesHash::of("up", &a), SeriesHash::of("up", &b));
        assert_ne!(SeriesHash::of("up", &a), SeriesHash::of("down", &a));
    }

    #[test]
    fn test_series_new_sorts_and_dedupes() {
        let s = series("a", &[(30, 3.0), (10, 1.0), (30, 4.0), (20, 2.0)]);
        let ts: Vec<_> = s.points.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![10, 20, 30]);
        assert_eq!(s.points[2].value, 4.0);
        assert_eq!(s.point_size, 3 * POINT_SIZE + "label".len() + 1);
    }

    #[test]
    fn test_merge_incoming_wins() {
        let base = Dataset::new(vec![series("a", &[(10, 1.0), (20, 2.0)])]);
        let incoming = Dataset::new(vec![series("a", &[(20, 9.0), (30, 3.0)])]);
        let merged = base.merge(&incoming);
        assert_eq!(merged.series.len(), 1);
        let values: Vec<_> = merged.series[0].points.iter().map(|p| (p.timestamp, p.value)).collect();
        assert_eq!(values, vec![(10, 1.0), (20, 9.0), (30, 3.0)]);
    }

    #[test]
    fn test_merge_keeps_base_only_series_and_appends_new() {
        let base = Dataset::new(vec![series("a", &[(10, 1.0)])]);
        let incoming = Dataset::new(vec![series("b", &[(10, 5.0)])]);
        let merged = base.merge(&incoming);
        assert_eq!(merged.series.len(), 2);
        assert_eq!(merged.series[0].header.labels["label"], "a");
        assert_eq!(merged.series[1].header.labels["label"], "b");
    }

    #[test]
    fn test_merge_scopes_identity_by_statement() {
        let mut first = series("a", &[(10, 1.0)]);
        first.header.statement_index = 0;
        let mut second = series("a", &[(10, 2.0)]);
        second.header.statement_index = 1;
        let merged = Dataset::new(vec![first]).merge(&Dataset::new(vec![second]));
        assert_eq!(merged.series.len(), 2);
        assert_eq!(merged.statement_count, 2);
    }

    #[test]
    fn test_merge_reports_header_conflict() {
        let base = Dataset::new(vec![series("a", &[(10, 1.0)])]);
        let mut conflicting = series("a", &[(20, 2.0)]);
        conflicting.header.value_kind = ValueKind::Integer;

        let (merged, ambiguities) = base.merge_with_report(&Dataset::new(vec![conflicting]));

        assert_eq!(ambiguities.len(), 1);
        assert!(matches!(ambiguities[0], DeltaError::MergeAmbiguity(_)));
        // last write wins, points are still unioned
        assert_eq!(merged.series.len(), 1);
        assert_eq!(merged.series[0].header.value_kind, ValueKind::Integer);
        assert_eq!(merged.point_count(), 2);

        let (_, none) = base.merge_with_report(&base);
        assert!(none.is_empty());
    }

    #[test]
    fn test_merge_idempotent() {
        let d = Dataset::new(vec![series("a", &[(10, 1.0), (20, 2.0)])]);
        let e = Dataset::new(vec![series("a", &[(30, 3.0)]), series("b", &[(10, 1.0)])]);
        assert_eq!(d.merge(&Dataset::default()), d);
        let once = d.merge(&e);
        assert_eq!(once.merge(&e), once);
    }

    #[test]
    fn test_merge_does_not_mutate_inputs() {
        let d = Dataset::new(vec![series("a", &[(10, 1.0)])]);
        let e = Dataset::new(vec![series("a", &[(20, 2.0)])]);
        let d_before = d.clone();
        let e_before = e.clone();
        let _ = d.merge(&e);
        assert_eq!(d, d_before);
        assert_eq!(e, e_before);
    }

    #[test]
    fn test_crop() {
        let d = Dataset::new(vec![
            series("a", &[(90, 0.0), (100, 1.0), (190, 2.0), (200, 3.0)]),
            series("b", &[(300, 1.0)]),
        ]);
        let cropped = d.crop(&Extent::new(100, 200));
        assert_eq!(cropped.series.len(), 1);
        assert_eq!(cropped.point_count(), 2);

        let instant = d.crop(&Extent::instant(190));
        assert_eq!(instant.point_count(), 1);
    }

    #[test]
    fn test_with_labels_changes_identity() {
        let d = Dataset::new(vec![series("a", &[(10, 1.0)])]);
        let tagged = d.with_labels(&labels(&[("region", "eu")]));
        assert_eq!(tagged.series[0].header.labels["region"], "eu");
        assert_ne!(tagged.series[0].lookup_key(), d.series[0].lookup_key());
    }
}
