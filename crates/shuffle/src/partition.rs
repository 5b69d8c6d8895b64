//! Post-shuffle partition range model.
//!
//! Contract:
//! - a post-shuffle partition is a contiguous `[reducer_start, reducer_end)`
//!   range over pre-shuffle partition ids crossed with a contiguous
//!   `[map_start, map_end)` range over mapper ids;
//! - non-skew reads span all mappers; skew reads span a single reducer and a
//!   narrower mapper range;
//! - malformed ranges are programming errors, not runtime failures.

/// Default split count cap for adaptive reads with no explicit boundaries.
// TODO: unify this cap with the per-partition split limit used by the
// skewed-join rewriter; the two bounds come from different revisions.
const DEFAULT_ADAPTIVE_SPLITS: u32 = 10;

/// One post-shuffle read assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleReadPartition {
    /// First reducer id read (inclusive).
    pub reducer_start: u32,
    /// Last reducer id read (exclusive).
    pub reducer_end: u32,
    /// First mapper id read (inclusive).
    pub map_start: u32,
    /// Last mapper id read (exclusive).
    pub map_end: u32,
}

impl ShuffleReadPartition {
    fn new(reducer_start: u32, reducer_end: u32, map_start: u32, map_end: u32) -> Self {
        assert!(
            reducer_start < reducer_end,
            "empty reducer range [{reducer_start}, {reducer_end})"
        );
        assert!(
            map_start < map_end,
            "empty mapper range [{map_start}, {map_end})"
        );
        Self {
            reducer_start,
            reducer_end,
            map_start,
            map_end,
        }
    }
}

/// Coalesced read: partition `i` reads reducer ids
/// `[start_indices[i], end_indices[i])` from all mappers.
///
/// A missing end array defaults each end to the next start (and `P` for the
/// last group); a missing start array degrades to the identity mapping of one
/// partition per reducer.
pub fn coalesced_read(
    start_indices: Option<&[u32]>,
    end_indices: Option<&[u32]>,
    num_reducers: u32,
    num_mappers: u32,
) -> Vec<ShuffleReadPartition> {
    assert!(num_reducers > 0, "shuffle with zero reducers");
    assert!(num_mappers > 0, "shuffle with zero mappers");

    let Some(starts) = start_indices else {
        return (0..num_reducers)
            .map(|r| ShuffleReadPartition::new(r, r + 1, 0, num_mappers))
            .collect();
    };
    assert!(!starts.is_empty(), "empty start-index array");
    assert!(starts[0] < num_reducers, "start index crosses reducer count");

    let mut out = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = match end_indices {
            Some(ends) => ends[i],
            None => starts.get(i + 1).copied().unwrap_or(num_reducers),
        };
        assert!(end <= num_reducers, "reducer range crosses partition count");
        out.push(ShuffleReadPartition::new(start, end, 0, num_mappers));
    }
    out
}

/// Local read: one post-shuffle partition per mapper, each covering that
/// single mapper's output across all reducer ids.
pub fn local_read(num_reducers: u32, num_mappers: u32) -> Vec<ShuffleReadPartition> {
    assert!(num_reducers > 0, "shuffle with zero reducers");
    assert!(num_mappers > 0, "shuffle with zero mappers");
    (0..num_mappers)
        .map(|m| ShuffleReadPartition::new(0, num_reducers, m, m + 1))
        .collect()
}

/// Adaptive (skew) read: split a single reducer id across mapper ranges.
///
/// `boundaries` must satisfy `m[0] = 0 < m[1] < … < m[k] = num_mappers`; the
/// read emits `k` partitions, partition `i` covering mappers
/// `[m[i], m[i+1])`. When no boundaries are supplied the mapper space is cut
/// into `min(DEFAULT_ADAPTIVE_SPLITS, num_mappers)` even ranges.
pub fn adaptive_read(
    reducer: u32,
    boundaries: Option<&[u32]>,
    num_reducers: u32,
    num_mappers: u32,
) -> Vec<ShuffleReadPartition> {
    assert!(reducer < num_reducers, "reducer id crosses partition count");
    assert!(num_mappers > 0, "shuffle with zero mappers");

    let default_bounds;
    let bounds = match boundaries {
        Some(b) => b,
        None => {
            let k = DEFAULT_ADAPTIVE_SPLITS.min(num_mappers);
            default_bounds = (0..=k)
                .map(|i| i * num_mappers / k)
                .collect::<Vec<_>>();
            &default_bounds
        }
    };

    assert!(bounds.len() >= 2, "adaptive read needs at least one range");
    assert_eq!(bounds[0], 0, "adaptive boundaries must start at mapper 0");
    assert_eq!(
        *bounds.last().expect("non-empty boundaries"),
        num_mappers,
        "adaptive boundaries must end at the mapper count"
    );

    bounds
        .windows(2)
        .map(|w| ShuffleReadPartition::new(reducer, reducer + 1, w[0], w[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesced_defaults_ends_to_next_start() {
        let parts = coalesced_read(Some(&[0, 2]), None, 4, 3);
        assert_eq!(
            parts,
            vec![
                ShuffleReadPartition {
                    reducer_start: 0,
                    reducer_end: 2,
                    map_start: 0,
                    map_end: 3
                },
                ShuffleReadPartition {
                    reducer_start: 2,
                    reducer_end: 4,
                    map_start: 0,
                    map_end: 3
                },
            ]
        );
    }

    #[test]
    fn coalesced_without_starts_is_identity() {
        let parts = coalesced_read(None, None, 3, 2);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().enumerate().all(|(i, p)| {
            p.reducer_start == i as u32 && p.reducer_end == i as u32 + 1 && p.map_end == 2
        }));
    }

    #[test]
    fn coalesced_honors_explicit_end_gaps() {
        let parts = coalesced_read(Some(&[0, 3]), Some(&[2, 4]), 4, 1);
        assert_eq!(parts[0].reducer_end, 2);
        assert_eq!(parts[1].reducer_start, 3);
    }

    #[test]
    fn local_read_is_one_partition_per_mapper() {
        let parts = local_read(4, 3);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.reducer_start == 0 && p.reducer_end == 4));
        assert_eq!(parts[2].map_start, 2);
        assert_eq!(parts[2].map_end, 3);
    }

    #[test]
    fn adaptive_read_covers_all_mappers() {
        let parts = adaptive_read(1, Some(&[0, 2, 5, 7, 10]), 4, 10);
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|p| p.reducer_start == 1 && p.reducer_end == 2));
        let covered: u32 = parts.iter().map(|p| p.map_end - p.map_start).sum();
        assert_eq!(covered, 10);
    }

    #[test]
    fn adaptive_read_default_boundaries_cap_at_ten() {
        let parts = adaptive_read(0, None, 1, 25);
        assert_eq!(parts.len(), 10);
        assert_eq!(parts[0].map_start, 0);
        assert_eq!(parts.last().expect("parts").map_end, 25);
    }

    #[test]
    fn adaptive_read_default_boundaries_cap_at_mapper_count() {
        let parts = adaptive_read(0, None, 1, 3);
        assert_eq!(parts.len(), 3);
    }

    #[test]
    #[should_panic(expected = "empty reducer range")]
    fn rejects_empty_reducer_range() {
        coalesced_read(Some(&[0, 2]), Some(&[2, 2]), 4, 1);
    }

    #[test]
    #[should_panic(expected = "crosses partition count")]
    fn rejects_range_crossing_reducer_count() {
        coalesced_read(Some(&[0]), Some(&[5]), 4, 1);
    }
}
