//! Prometheus backend provider
//!
//! Parses `/api/v1/query_range` and `/api/v1/query` parameters into a
//! [`TimeRangeQuery`], fetches gaps from each host, and converts between the
//! Prometheus JSON result format and [`Dataset`].

use crate::backend::Backend;
use crate::backfill::extract_tolerance_directive;
use crate::config::BackendConfig;
use crate::error::{DeltaError, Result};
use crate::models::{Extent, TimeRangeQuery, Timestamp};
use crate::series::{Dataset, Point, Series, SeriesHeader};
use crate::upstream::UpstreamClient;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const API_PATH: &str = "/api/v1/";
pub const QUERY_RANGE: &str = "query_range";
pub const QUERY: &str = "query";

const PARAM_QUERY: &str = "query";
const PARAM_START: &str = "start";
const PARAM_END: &str = "end";
const PARAM_STEP: &str = "step";
const PARAM_TIME: &str = "time";

const METRIC_NAME_LABEL: &str = "__name__";

/// Instant queries without a `time` parameter are rounded down to this
const INSTANT_ROUND_MS: i64 = 15_000;

/// Statement directive that turns fast-forward off for one query
pub const FAST_FORWARD_OFF_DIRECTIVE: &str = "fast-forward:off";

/// Exclusive bound on millisecond values that fit a `Timestamp`
const MAX_MS: f64 = 9_223_372_036_854_775_808.0;

/// Parse a Prometheus timestamp (float seconds) into milliseconds
pub fn parse_time(s: &str) -> Result<Timestamp> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| DeltaError::MalformedQuery(format!("cannot parse {:?} to a valid timestamp", s)))?;
    let ms = (secs * 1000.0).round();
    if !ms.is_finite() || ms < -MAX_MS || ms >= MAX_MS {
        return Err(DeltaError::MalformedQuery(format!(
            "cannot parse {:?} to a valid timestamp",
            s
        )));
    }
    Ok(ms as Timestamp)
}

/// Parse a step: float seconds, or a duration string like `15s`, `5m`, `1h30m`, `1d`
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || DeltaError::MalformedQuery(format!("invalid duration {:?}", s));
    if let Ok(secs) = s.parse::<f64>() {
        let ms = (secs * 1000.0).round();
        if !ms.is_finite() || ms < 0.0 || ms >= MAX_MS {
            return Err(invalid());
        }
        return Ok(Duration::from_millis(ms as u64));
    }

    let mut total_ms: u64 = 0;
    let mut rest = s;
    if rest.is_empty() {
        return Err(invalid());
    }
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        if digits_end == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits_end].parse().map_err(|_| invalid())?;
        rest = &rest[digits_end..];
        let unit_end = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit_ms = match &rest[..unit_end] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            "y" => 31_536_000_000,
            _ => return Err(invalid()),
        };
        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .filter(|total| i64::try_from(*total).is_ok())
            .ok_or_else(invalid)?;
        rest = &rest[unit_end..];
    }
    Ok(Duration::from_millis(total_ms))
}

fn format_time(ts: Timestamp) -> String {
    format!("{:.3}", ts as f64 / 1000.0)
}

/// Render a sample value the way Prometheus does
fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "+Inf".to_string() } else { "-Inf".to_string() }
    } else {
        v.to_string()
    }
}

fn parse_value(s: &str) -> Result<f64> {
    match s {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => s
            .parse()
            .map_err(|_| DeltaError::ParseError(format!("invalid sample value {:?}", s))),
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<ApiSeries>,
}

#[derive(Debug, Deserialize)]
struct ApiSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
    #[serde(default)]
    value: Option<(f64, String)>,
}

/// Decode a Prometheus `matrix` or `vector` response body into a dataset
pub fn decode_response(body: &[u8]) -> Result<Dataset> {
    let response: ApiResponse = serde_json::from_slice(body)
        .map_err(|e| DeltaError::ParseError(format!("invalid Prometheus response: {}", e)))?;

    if response.status != "success" {
        return Err(DeltaError::ParseError(format!(
            "Prometheus returned {}: {}",
            response.error_type.unwrap_or_else(|| response.status.clone()),
            response.error.unwrap_or_default()
        )));
    }
    let data = response
        .data
        .ok_or_else(|| DeltaError::ParseError("Prometheus response has no data".to_string()))?;
    if data.result_type != "matrix" && data.result_type != "vector" {
        return Err(DeltaError::ParseError(format!(
            "unsupported result type {:?}",
            data.result_type
        )));
    }

    let mut series = Vec::with_capacity(data.result.len());
    for s in data.result {
        let mut labels = s.metric;
        let name = labels.remove(METRIC_NAME_LABEL).unwrap_or_default();
        let samples = s.values.into_iter().chain(s.value);
        let points = samples
            .map(|(t, v)| -> Result<Point> {
                Ok(Point::new((t * 1000.0).round() as Timestamp, parse_value(&v)?))
            })
            .collect::<Result<Vec<_>>>()?;
        series.push(Series::new(SeriesHeader::new(name, labels), points));
    }
    Ok(Dataset::new(series))
}

/// Render a dataset as a Prometheus success document
///
/// Range results are rendered as a `matrix`; instant results as a `vector`
/// holding each series' latest point.
pub fn render_dataset(dataset: &Dataset, instant: bool) -> Result<Bytes> {
    let result: Vec<Value> = dataset
        .series
        .iter()
        .map(|s| {
            let mut metric = serde_json::Map::new();
            if !s.header.name.is_empty() {
                metric.insert(METRIC_NAME_LABEL.to_string(), json!(s.header.name));
            }
            for (k, v) in &s.header.labels {
                metric.insert(k.clone(), json!(v));
            }
            let sample = |p: &Point| json!([p.timestamp as f64 / 1000.0, format_value(p.value)]);
            if instant {
                let value = s.points.last().map(sample).unwrap_or(Value::Null);
                json!({ "metric": metric, "value": value })
            } else {
                let values: Vec<Value> = s.points.iter().map(sample).collect();
                json!({ "metric": metric, "values": values })
            }
        })
        .collect();

    let result_type = if instant { "vector" } else { "matrix" };
    let doc = json!({
        "status": "success",
        "data": {
            "resultType": result_type,
            "result": result,
        }
    });
    serde_json::to_vec(&doc)
        .map(Bytes::from)
        .map_err(|e| DeltaError::InternalError(format!("failed to render response: {}", e)))
}

/// Render an error the way the Prometheus API does
pub fn render_error(err: &DeltaError) -> Bytes {
    let doc = json!({
        "status": "error",
        "errorType": err.error_type(),
        "error": err.to_string(),
    });
    Bytes::from(doc.to_string())
}

/// Prometheus-compatible backend
pub struct PrometheusBackend {
    name: String,
    hosts: Vec<String>,
    backfill_tolerance: Duration,
    labels: BTreeMap<String, String>,
    fast_forward_disable: bool,
    client: UpstreamClient,
}

impl PrometheusBackend {
    pub fn new(name: impl Into<String>, config: &BackendConfig, client: UpstreamClient) -> Self {
        PrometheusBackend {
            name: name.into(),
            hosts: config
                .hosts
                .iter()
                .map(|h| h.trim_end_matches('/').to_string())
                .collect(),
            backfill_tolerance: config.backfill_tolerance(),
            labels: config.labels.clone(),
            fast_forward_disable: config.fast_forward_disable,
            client,
        }
    }

    fn required<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
        params
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| DeltaError::MalformedQuery(format!("missing URL parameter: {}", name)))
    }

    fn now_rounded() -> Timestamp {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0);
        now - now.rem_euclid(INSTANT_ROUND_MS)
    }
}

#[async_trait]
impl Backend for PrometheusBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn default_backfill_tolerance(&self) -> Duration {
        self.backfill_tolerance
    }

    fn supports_fast_forward(&self) -> bool {
        !self.fast_forward_disable
    }

    fn parse_query(&self, params: &HashMap<String, String>, instant: bool) -> Result<TimeRangeQuery> {
        let statement = Self::required(params, PARAM_QUERY)?.to_string();

        let (extent, step) = if instant {
            let at = match params.get(PARAM_TIME).filter(|v| !v.is_empty()) {
                Some(t) => parse_time(t)?,
                None => Self::now_rounded(),
            };
            (Extent::instant(at), Duration::ZERO)
        } else {
            let start = parse_time(Self::required(params, PARAM_START)?)?;
            let end = parse_time(Self::required(params, PARAM_END)?)?;
            let step = parse_duration(Self::required(params, PARAM_STEP)?)?;
            if step.is_zero() {
                return Err(DeltaError::MalformedQuery(
                    "zero or negative query resolution step widths are not accepted".to_string(),
                ));
            }
            (Extent { start, end }, step)
        };

        let backfill_tolerance =
            extract_tolerance_directive(&statement).unwrap_or(self.backfill_tolerance);

        let is_offset = statement.contains(" offset ");
        let query = TimeRangeQuery {
            is_offset,
            // an offset query's latest point is not the value at "now"
            fast_forward_disable: is_offset || statement.contains(FAST_FORWARD_OFF_DIRECTIVE),
            statement,
            extent,
            step,
            backfill_tolerance,
            labels: self.labels.clone(),
        };
        query.validate()?;
        Ok(query)
    }

    async fn fetch(&self, host: &str, query: &TimeRangeQuery) -> Result<Dataset> {
        let (url, params) = if query.is_instant() {
            (
                format!("{}{}{}", host, API_PATH, QUERY),
                vec![
                    (PARAM_QUERY, query.statement.clone()),
                    (PARAM_TIME, format_time(query.extent.start)),
                ],
            )
        } else {
            // Prometheus treats `end` as inclusive
            let last = query.extent.end.saturating_sub(1).max(query.extent.start);
            (
                format!("{}{}{}", host, API_PATH, QUERY_RANGE),
                vec![
                    (PARAM_QUERY, query.statement.clone()),
                    (PARAM_START, format_time(query.extent.start)),
                    (PARAM_END, format_time(last)),
                    (PARAM_STEP, format!("{:.3}", query.step.as_secs_f64())),
                ],
            )
        };

        debug!("Fetching from Prometheus: host={}, extent={}", host, query.extent);
        let body = self.client.get(&url, &params).await?;
        let dataset = decode_response(&body)?;
        Ok(dataset.with_labels(&self.labels).crop(&query.extent))
    }

    fn render(&self, dataset: &Dataset, instant: bool) -> Result<Bytes> {
        render_dataset(dataset, instant)
    }
}
