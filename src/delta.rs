//! Delta Calculator
//!
//! Works out which parts of a requested extent must be fetched upstream given
//! what a cached entity already knows.

use crate::models::{Extent, Timestamp};
use tracing::debug;

/// Outcome of a delta computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// Disjoint, ascending sub-extents to fetch upstream
    pub to_fetch: Vec<Extent>,
    /// Portion of the request the cache already covers
    pub covered: Extent,
}

impl Delta {
    /// Delta for a request with no cached entity at all
    pub fn fetch_all(requested: &Extent) -> Self {
        Delta {
            to_fetch: vec![*requested],
            covered: Extent::instant(requested.start),
        }
    }

    /// Nothing needs fetching
    pub fn is_full_hit(&self) -> bool {
        self.to_fetch.is_empty()
    }

    /// The cache contributes nothing
    pub fn is_miss(&self) -> bool {
        self.covered.is_empty() && !self.to_fetch.is_empty()
    }
}

/// Compute the sub-extents of `requested` that `known` does not cover
///
/// `known` is first clamped so it never extends past `cutoff`; anything at or
/// after the cutoff is always refetched. Fetch extents never leave
/// `requested`. A zero-width request (an instant) is only satisfied when
/// `known` is exactly that instant.
pub fn compute_delta(requested: &Extent, known: &Extent, cutoff: Timestamp) -> Delta {
    if requested.is_instant() {
        let covered = known.is_instant() && known.start == requested.start && requested.start < cutoff;
        debug!("Instant delta: at={}, covered={}", requested.start, covered);
        return if covered {
            Delta { to_fetch: Vec::new(), covered: *requested }
        } else {
            Delta::fetch_all(requested)
        };
    }

    let clamped_known = known.clamp_end(cutoff);
    if clamped_known.is_empty() {
        debug!("No usable cached extent for {}, fetching all", requested);
        return Delta::fetch_all(requested);
    }

    let covered = requested.intersection(&clamped_known);
    let to_fetch = coalesce(
        requested
            .subtract(&clamped_known)
            .into_iter()
            .map(|gap| gap.clamp_end(requested.end))
            .collect(),
    );

    debug!(
        "Delta for {}: known={}, cutoff={}, covered={}, gaps={}",
        requested,
        clamped_known,
        cutoff,
        covered,
        to_fetch.len()
    );

    Delta { to_fetch, covered }
}

/// Merge overlapping or touching extents into the minimal ascending set
///
/// Empty extents are dropped.
pub fn coalesce(mut extents: Vec<Extent>) -> Vec<Extent> {
    extents.retain(|e| !e.is_empty());
    extents.sort_by_key(|e| (e.start, e.end));

    let mut out: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents {
        match out.last_mut() {
            Some(last) if extent.start <= last.end => {
                last.end = last.end.max(extent.end);
            }
            _ => out.push(extent),
        }
    }
    out
}
