//! Backfill tolerance policy
//!
//! Data close to "now" may still be revised upstream. Everything at or after
//! the cutoff is refetched on every request and never recorded as known.

use crate::models::Timestamp;
use std::time::Duration;

/// Statement directive overriding the backfill tolerance, in seconds
pub const BACKFILL_TOLERANCE_DIRECTIVE: &str = "backfill-tolerance:";

/// Computes the cacheable cutoff for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackfillPolicy {
    tolerance: Duration,
}

impl BackfillPolicy {
    pub fn new(tolerance: Duration) -> Self {
        BackfillPolicy { tolerance }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// `now - tolerance`; with no tolerance only strictly-past data is cacheable
    ///
    /// `now` is supplied by the caller so the policy never samples the clock.
    pub fn cutoff(&self, now: Timestamp) -> Timestamp {
        let tolerance = i64::try_from(self.tolerance.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(tolerance).min(now)
    }

    /// The cutoff floored onto the step grid of a range query
    ///
    /// Known extents then always end on a step boundary, so the next gap is
    /// evaluated on the same grid as the cached points. A zero step (instant
    /// query) leaves the cutoff unaligned.
    pub fn step_cutoff(&self, now: Timestamp, step: Duration) -> Timestamp {
        let cutoff = self.cutoff(now);
        match i64::try_from(step.as_millis()) {
            Ok(step) if step > 0 => cutoff.saturating_sub(cutoff.rem_euclid(step)),
            _ => cutoff,
        }
    }
}

/// Read a `backfill-tolerance:<seconds>` directive embedded in a statement
pub fn extract_tolerance_directive(statement: &str) -> Option<Duration> {
    let at = statement.find(BACKFILL_TOLERANCE_DIRECTIVE)?;
    let digits: String = statement[at + BACKFILL_TOLERANCE_DIRECTIVE.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok().map(Duration::from_secs)
}
