//! Core data models: time extents and parsed range queries

use crate::error::{DeltaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// A half-open time interval `[start, end)`
///
/// A zero-width extent (`start == end`) contains no time for the purposes of
/// set algebra. The delta calculator treats it as a single instant instead,
/// which is how instantaneous queries are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent {
    /// First timestamp covered (inclusive)
    pub start: Timestamp,
    /// End of the interval (exclusive)
    pub end: Timestamp,
}

impl Extent {
    /// Create a new extent, normalizing `start > end` to a zero-width extent
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Extent { start, end }.normalize()
    }

    /// Create a zero-width extent representing a single instant
    pub fn instant(at: Timestamp) -> Self {
        Extent { start: at, end: at }
    }

    /// Clamp a malformed extent (`start > end`) to the zero-width extent `[start, start)`
    pub fn normalize(self) -> Self {
        if self.start > self.end {
            Extent { start: self.start, end: self.start }
        } else {
            self
        }
    }

    /// Whether `start > end`
    pub fn is_malformed(&self) -> bool {
        self.start > self.end
    }

    /// True when the extent covers no time
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True for a well-formed zero-width extent
    pub fn is_instant(&self) -> bool {
        self.start == self.end
    }

    /// Whether the timestamp falls inside `[start, end)`
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Whether `other` lies entirely within this extent
    pub fn covers(&self, other: &Extent) -> bool {
        if other.is_empty() {
            return self.start <= other.start && other.start <= self.end;
        }
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the two extents share at least one instant
    pub fn intersects(&self, other: &Extent) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    /// The overlapping portion, or a zero-width extent when they do not overlap
    pub fn intersection(&self, other: &Extent) -> Extent {
        if !self.intersects(other) {
            return Extent::instant(self.start.max(other.start));
        }
        Extent {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        }
    }

    /// Union of two overlapping or touching extents
    ///
    /// An empty operand is the identity. Extents separated by a gap cannot be
    /// represented as one interval and produce `NonContiguousExtents`.
    pub fn union(&self, other: &Extent) -> Result<Extent> {
        if other.is_empty() {
            return Ok(self.normalize());
        }
        if self.is_empty() {
            return Ok(*other);
        }
        if self.start > other.end || other.start > self.end {
            return Err(DeltaError::NonContiguousExtents {
                a: self.to_string(),
                b: other.to_string(),
            });
        }
        Ok(Extent {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        })
    }

    /// The parts of this extent not covered by `other` (0, 1 or 2 extents)
    pub fn subtract(&self, other: &Extent) -> Vec<Extent> {
        if self.is_empty() {
            return Vec::new();
        }
        if !self.intersects(other) {
            return vec![*self];
        }
        let mut out = Vec::with_capacity(2);
        if self.start < other.start {
            out.push(Extent { start: self.start, end: other.start });
        }
        if other.end < self.end {
            out.push(Extent { start: other.end, end: self.end });
        }
        out
    }

    /// Cap the end of the extent at `limit`
    pub fn clamp_end(&self, limit: Timestamp) -> Extent {
        Extent::new(self.start, self.end.min(limit))
    }

    /// Expand the extent outward to step boundaries
    ///
    /// Start floors and end ceils to a multiple of `step`. Zero steps and
    /// empty extents are returned unchanged. Fails with `MalformedQuery` when
    /// a boundary would fall outside the timestamp range.
    pub fn align_to_step(&self, step: Duration) -> Result<Extent> {
        let step = step_millis(step)?;
        if step == 0 || self.is_empty() {
            return Ok(*self);
        }
        let out_of_range = || {
            DeltaError::MalformedQuery(format!(
                "extent {} cannot be aligned to a {}ms step",
                self, step
            ))
        };
        let start = self.start.checked_sub(self.start.rem_euclid(step)).ok_or_else(out_of_range)?;
        let end = match self.end.rem_euclid(step) {
            0 => self.end,
            rem => self.end.checked_add(step - rem).ok_or_else(out_of_range)?,
        };
        Ok(Extent { start, end })
    }
}

/// A step in milliseconds, rejecting steps past the timestamp range
fn step_millis(step: Duration) -> Result<i64> {
    i64::try_from(step.as_millis())
        .map_err(|_| DeltaError::MalformedQuery(format!("step {:?} is out of range", step)))
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A parsed time range query, immutable once built by a backend parser
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeRangeQuery {
    /// The query statement, passed to the upstream verbatim
    pub statement: String,
    /// Requested time range
    pub extent: Extent,
    /// Resolution; zero denotes an instantaneous query
    pub step: Duration,
    /// Trailing window before "now" that is never cached as complete
    pub backfill_tolerance: Duration,
    /// Whether the statement shifts its evaluation time with an offset modifier
    pub is_offset: bool,
    /// Never append a live point at "now" to range results
    pub fast_forward_disable: bool,
    /// Labels attached to every series returned for this query
    pub labels: BTreeMap<String, String>,
}

impl TimeRangeQuery {
    /// Create a range query
    pub fn new(statement: impl Into<String>, extent: Extent, step: Duration) -> Self {
        TimeRangeQuery {
            statement: statement.into(),
            extent,
            step,
            ..Default::default()
        }
    }

    /// Set the backfill tolerance
    pub fn with_backfill_tolerance(mut self, tolerance: Duration) -> Self {
        self.backfill_tolerance = tolerance;
        self
    }

    /// Whether this is the instantaneous (zero-step) variant
    pub fn is_instant(&self) -> bool {
        self.step.is_zero()
    }

    /// Step in milliseconds, saturating for steps past the timestamp range
    ///
    /// Validated queries never saturate.
    pub fn step_ms(&self) -> i64 {
        i64::try_from(self.step.as_millis()).unwrap_or(i64::MAX)
    }

    /// Reject queries that cannot be served
    ///
    /// Range queries need `start <= end` and a positive step; instantaneous
    /// queries need a zero-width extent.
    pub fn validate(&self) -> Result<()> {
        if self.statement.trim().is_empty() {
            return Err(DeltaError::MalformedQuery("empty statement".to_string()));
        }
        if self.extent.is_malformed() {
            return Err(DeltaError::MalformedQuery(format!(
                "start ({}) must be <= end ({})",
                self.extent.start, self.extent.end
            )));
        }
        if self.is_instant() && !self.extent.is_instant() {
            return Err(DeltaError::MalformedQuery(
                "step must be > 0 for range queries".to_string(),
            ));
        }
        step_millis(self.step)?;
        Ok(())
    }

    /// The step aligned form of this query; instant queries are unchanged
    pub fn aligned(&self) -> Result<Self> {
        if self.is_instant() {
            return Ok(self.clone());
        }
        Ok(self.with_extent(self.extent.align_to_step(self.step)?))
    }

    /// A copy of this query restricted to a sub-extent
    pub fn with_extent(&self, extent: Extent) -> Self {
        TimeRangeQuery {
            extent,
            ..self.clone()
        }
    }
}
