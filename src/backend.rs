//! Backend provider capability
//!
//! The orchestrator is written against this trait only; it never branches on
//! which provider it is talking to.

use crate::error::Result;
use crate::models::TimeRangeQuery;
use crate::series::Dataset;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// A logical time-series backend made of one or more upstream hosts
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name the backend is registered and routed under
    fn name(&self) -> &str;

    /// Base URLs of the physical hosts a query fans out to
    fn hosts(&self) -> &[String];

    /// Tolerance used when a query carries no tolerance of its own
    fn default_backfill_tolerance(&self) -> Duration;

    /// Whether range queries reaching "now" may be topped up with an
    /// instantaneous fetch at "now"
    fn supports_fast_forward(&self) -> bool {
        false
    }

    /// Build a query from inbound request parameters
    ///
    /// `instant` selects the instantaneous variant (zero step).
    fn parse_query(&self, params: &HashMap<String, String>, instant: bool) -> Result<TimeRangeQuery>;

    /// Fetch `query` (already restricted to one gap) from a single host
    async fn fetch(&self, host: &str, query: &TimeRangeQuery) -> Result<Dataset>;

    /// Render a dataset as a response body
    fn render(&self, dataset: &Dataset, instant: bool) -> Result<Bytes>;
}
