// Property: delta computation against a cached extent
//
// Fetch extents never leave the request, never overlap what is covered, and
// together with the covered part account for the whole request. Nothing at or
// past the backfill cutoff is ever reported as covered.

use delta_proxy::{compute_delta, BackfillPolicy, Extent};
use proptest::prelude::*;
use std::time::Duration;

fn span(e: &Extent) -> i64 {
    (e.end - e.start).max(0)
}

fn extent() -> impl Strategy<Value = Extent> {
    (0i64..10_000, 1i64..5_000).prop_map(|(start, len)| Extent::new(start, start + len))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_fetch_and_covered_partition_request(
        requested in extent(),
        known in extent(),
        cutoff in 0i64..16_000,
    ) {
        let delta = compute_delta(&requested, &known, cutoff);

        let fetched: i64 = delta.to_fetch.iter().map(span).sum();
        prop_assert_eq!(fetched + span(&delta.covered), span(&requested));

        for gap in &delta.to_fetch {
            prop_assert!(requested.covers(gap));
            prop_assert!(!gap.intersects(&delta.covered));
        }
        for pair in delta.to_fetch.windows(2) {
            prop_assert!(pair[0].end < pair[1].start);
        }
        if !delta.covered.is_empty() {
            prop_assert!(delta.covered.end <= cutoff);
        }
    }

    #[test]
    fn prop_fully_known_below_cutoff_is_hit(
        requested in extent(),
        head in 0i64..1000,
        tail in 0i64..1000,
        slack in 0i64..1000,
    ) {
        let known = Extent::new(requested.start - head, requested.end + tail);
        let cutoff = known.end + slack;
        let delta = compute_delta(&requested, &known, cutoff);

        prop_assert!(delta.to_fetch.is_empty());
        prop_assert_eq!(delta.covered, requested);
    }

    #[test]
    fn prop_disjoint_known_fetches_everything(
        requested in extent(),
        distance in 1i64..1000,
        len in 1i64..1000,
    ) {
        let known = Extent::new(requested.end + distance, requested.end + distance + len);
        let delta = compute_delta(&requested, &known, i64::MAX);

        prop_assert_eq!(delta.to_fetch, vec![requested]);
        prop_assert!(delta.covered.is_empty());
    }

    #[test]
    fn prop_cutoff_saturates(now in any::<i64>(), tolerance_secs in any::<u64>()) {
        let policy = BackfillPolicy::new(Duration::from_secs(tolerance_secs));
        let cutoff = policy.cutoff(now);
        prop_assert!(cutoff <= now);
        if tolerance_secs > 0 {
            prop_assert!(cutoff < now || now == i64::MIN);
        }
    }

    #[test]
    fn prop_step_cutoff_is_on_grid(
        now in -1_000_000i64..1_000_000,
        tolerance_ms in 0u64..100_000,
        step_ms in 1u64..10_000,
    ) {
        let policy = BackfillPolicy::new(Duration::from_millis(tolerance_ms));
        let cutoff = policy.step_cutoff(now, Duration::from_millis(step_ms));
        prop_assert_eq!(cutoff.rem_euclid(step_ms as i64), 0);
        prop_assert!(cutoff <= policy.cutoff(now));
        prop_assert!(policy.cutoff(now) - cutoff < step_ms as i64);
    }

    #[test]
    fn prop_instant_hit_only_on_exact_match(at in 0i64..1000, other in 0i64..1000) {
        let requested = Extent::instant(at);
        let delta = compute_delta(&requested, &Extent::instant(other), 2000);

        if at == other {
            prop_assert!(delta.is_full_hit());
        } else {
            prop_assert_eq!(delta.to_fetch, vec![requested]);
        }
    }
}
