//! Exchange coordinator: map-output statistics to post-shuffle ranges.
//!
//! Pure and stateless; the same statistics always yield the same ranges, and
//! all arithmetic is integral so there are no floating-point tie-breaks.

use std::collections::BTreeSet;

use stageflow_common::{AdaptiveConfig, Result, SfError};
use stageflow_shuffle::MapOutputStatistics;

/// Turns observed map-output statistics into coalesced partition ranges.
#[derive(Debug, Clone)]
pub struct ExchangeCoordinator {
    target_post_shuffle_input_size: u64,
    target_post_shuffle_row_count: Option<u64>,
    min_num_post_shuffle_partitions: Option<u32>,
}

impl ExchangeCoordinator {
    /// Coordinator with explicit targets.
    pub fn new(
        target_post_shuffle_input_size: u64,
        target_post_shuffle_row_count: Option<u64>,
        min_num_post_shuffle_partitions: Option<u32>,
    ) -> Self {
        Self {
            target_post_shuffle_input_size,
            target_post_shuffle_row_count,
            min_num_post_shuffle_partitions,
        }
    }

    /// Coordinator configured from the adaptive config.
    pub fn from_config(cfg: &AdaptiveConfig) -> Self {
        Self::new(
            cfg.target_post_shuffle_input_size,
            cfg.target_post_shuffle_row_count,
            cfg.min_num_post_shuffle_partitions,
        )
    }

    /// Coalesced group start indices over `[0, P)`.
    ///
    /// The result is strictly increasing, starts at 0, and has at least
    /// `min_num_post_shuffle_partitions` entries when that bound is set.
    pub fn estimate_partition_start_indices(
        &self,
        stats: &[&MapOutputStatistics],
    ) -> Result<Vec<u32>> {
        let p = validate_partition_count(stats)?;
        let (sum_bytes, sum_rows) = sum_statistics(stats, p);

        // A non-positive byte target degrades to no coalescing.
        if self.target_post_shuffle_input_size == 0 {
            return Ok((0..p as u32).collect());
        }
        let target_bytes = self.scaled_byte_target(p);

        let mut groups: Vec<(u32, u32)> = Vec::new();
        let mut start = 0_u32;
        let mut acc_bytes = sum_bytes[0];
        let mut acc_rows = sum_rows[0];
        for r in 1..p as u32 {
            if self.exceeds_targets(acc_bytes, acc_rows, sum_bytes[r as usize], sum_rows[r as usize], target_bytes)
            {
                groups.push((start, r));
                start = r;
                acc_bytes = sum_bytes[r as usize];
                acc_rows = sum_rows[r as usize];
            } else {
                acc_bytes += sum_bytes[r as usize];
                acc_rows += sum_rows[r as usize];
            }
        }
        groups.push((start, p as u32));

        if let Some(min) = self.min_num_post_shuffle_partitions {
            split_largest_groups(&mut groups, &sum_bytes, min as usize);
        }

        Ok(groups.into_iter().map(|(s, _)| s).collect())
    }

    /// Coalesced `(start, end)` ranges over `[0, P)` with every reducer id in
    /// `skewed` left as a gap.
    ///
    /// No emitted range contains a skewed id; the union of emitted ranges is
    /// exactly `[0, P)` minus the skewed ids.
    pub fn estimate_partition_start_end_indices(
        &self,
        stats: &[&MapOutputStatistics],
        skewed: &BTreeSet<u32>,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        let p = validate_partition_count(stats)?;
        let (sum_bytes, sum_rows) = sum_statistics(stats, p);
        let no_coalescing = self.target_post_shuffle_input_size == 0;
        let target_bytes = self.scaled_byte_target(p);

        let mut starts = Vec::new();
        let mut ends = Vec::new();
        let mut open: Option<(u32, u64, u64)> = None;
        for r in 0..p as u32 {
            if skewed.contains(&r) {
                if let Some((start, _, _)) = open.take() {
                    starts.push(start);
                    ends.push(r);
                }
                continue;
            }
            let bytes = sum_bytes[r as usize];
            let rows = sum_rows[r as usize];
            match open {
                None => open = Some((r, bytes, rows)),
                Some((start, acc_bytes, acc_rows)) => {
                    if no_coalescing
                        || self.exceeds_targets(acc_bytes, acc_rows, bytes, rows, target_bytes)
                    {
                        starts.push(start);
                        ends.push(r);
                        open = Some((r, bytes, rows));
                    } else {
                        open = Some((start, acc_bytes + bytes, acc_rows + rows));
                    }
                }
            }
        }
        if let Some((start, _, _)) = open {
            starts.push(start);
            ends.push(p as u32);
        }
        Ok((starts, ends))
    }

    // Scaling keeps the group count near the configured minimum instead of
    // producing a handful of giant groups.
    fn scaled_byte_target(&self, p: usize) -> u64 {
        let mut target = self.target_post_shuffle_input_size;
        if let Some(min) = self.min_num_post_shuffle_partitions {
            if min > 0 {
                target = (target / (p as u64 / u64::from(min)).max(1)).max(1);
            }
        }
        target
    }

    fn exceeds_targets(
        &self,
        acc_bytes: u64,
        acc_rows: u64,
        next_bytes: u64,
        next_rows: u64,
        target_bytes: u64,
    ) -> bool {
        if acc_bytes.saturating_add(next_bytes) > target_bytes {
            return true;
        }
        match self.target_post_shuffle_row_count {
            Some(target_rows) => acc_rows.saturating_add(next_rows) > target_rows,
            None => false,
        }
    }
}

/// One bucket of the partition-bytes histogram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionBytesBucket {
    /// Inclusive upper bound in bytes for the bucket.
    pub upper_bound_bytes: u64,
    /// Number of reducer ids in this bucket.
    pub partition_count: u32,
}

/// Stable histogram of per-reducer byte sizes, for decision diagnostics.
pub fn partition_bytes_histogram(stats: &MapOutputStatistics) -> Vec<PartitionBytesBucket> {
    const BOUNDS: &[u64] = &[
        64 * 1024,
        256 * 1024,
        1024 * 1024,
        4 * 1024 * 1024,
        16 * 1024 * 1024,
        64 * 1024 * 1024,
        u64::MAX,
    ];
    let mut counts = vec![0_u32; BOUNDS.len()];
    for bytes in &stats.bytes_by_partition {
        let idx = BOUNDS
            .iter()
            .position(|b| bytes <= b)
            .unwrap_or(BOUNDS.len() - 1);
        counts[idx] = counts[idx].saturating_add(1);
    }
    BOUNDS
        .iter()
        .zip(counts)
        .filter(|(_, c)| *c > 0)
        .map(|(upper, partition_count)| PartitionBytesBucket {
            upper_bound_bytes: *upper,
            partition_count,
        })
        .collect()
}

fn validate_partition_count(stats: &[&MapOutputStatistics]) -> Result<usize> {
    let first = stats.first().ok_or_else(|| {
        SfError::Coordinator("partition estimation requires at least one statistics input".to_string())
    })?;
    let p = first.num_partitions();
    if p == 0 {
        return Err(SfError::Coordinator(
            "map-output statistics with zero partitions".to_string(),
        ));
    }
    for s in stats {
        if s.num_partitions() != p {
            return Err(SfError::Coordinator(format!(
                "statistics disagree on pre-shuffle partition count: {} vs {p}",
                s.num_partitions()
            )));
        }
    }
    Ok(p)
}

fn sum_statistics(stats: &[&MapOutputStatistics], p: usize) -> (Vec<u64>, Vec<u64>) {
    let mut bytes = vec![0_u64; p];
    let mut rows = vec![0_u64; p];
    for s in stats {
        for r in 0..p {
            bytes[r] += s.bytes_by_partition[r];
            rows[r] += s.rows_by_partition[r];
        }
    }
    (bytes, rows)
}

// Split the heaviest multi-reducer groups in half until the minimum group
// count is met or nothing is splittable.
fn split_largest_groups(groups: &mut Vec<(u32, u32)>, sum_bytes: &[u64], min: usize) {
    while groups.len() < min {
        let heaviest = groups
            .iter()
            .enumerate()
            .filter(|(_, (s, e))| e - s > 1)
            .max_by(|(ia, (sa, ea)), (ib, (sb, eb))| {
                let wa: u64 = sum_bytes[*sa as usize..*ea as usize].iter().sum();
                let wb: u64 = sum_bytes[*sb as usize..*eb as usize].iter().sum();
                wa.cmp(&wb).then(ib.cmp(ia))
            })
            .map(|(i, _)| i);
        let Some(idx) = heaviest else {
            break;
        };
        let (start, end) = groups.remove(idx);
        let mid = start + (end - start) / 2;
        groups.insert(idx, (mid, end));
        groups.insert(idx, (start, mid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(bytes: Vec<u64>, rows: Vec<u64>) -> MapOutputStatistics {
        MapOutputStatistics::new(bytes, rows, 1).expect("stats")
    }

    #[test]
    fn coalesces_two_inputs_against_byte_target() {
        let a = stats(vec![10, 10, 10, 10], vec![1, 1, 1, 1]);
        let b = stats(vec![10, 10, 10, 10], vec![1, 1, 1, 1]);
        let coord = ExchangeCoordinator::new(40, None, None);
        let starts = coord
            .estimate_partition_start_indices(&[&a, &b])
            .expect("starts");
        assert_eq!(starts, vec![0, 2]);
    }

    #[test]
    fn row_target_forces_singleton_groups() {
        let a = stats(vec![1, 1, 1, 1], vec![100, 100, 100, 100]);
        let coord = ExchangeCoordinator::new(1_000_000_000, Some(150), None);
        let starts = coord.estimate_partition_start_indices(&[&a]).expect("starts");
        assert_eq!(starts, vec![0, 1, 2, 3]);
    }

    #[test]
    fn minimum_partitions_split_large_groups() {
        let a = stats(vec![1; 8], vec![1; 8]);
        let coord = ExchangeCoordinator::new(1_000_000_000, None, Some(4));
        let starts = coord.estimate_partition_start_indices(&[&a]).expect("starts");
        assert!(starts.len() >= 4);
        assert_eq!(starts[0], 0);
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
        assert!(*starts.last().expect("non-empty") < 8);
    }

    #[test]
    fn zero_target_degrades_to_no_coalescing() {
        let a = stats(vec![5, 5, 5], vec![1, 1, 1]);
        let coord = ExchangeCoordinator::new(0, None, None);
        let starts = coord.estimate_partition_start_indices(&[&a]).expect("starts");
        assert_eq!(starts, vec![0, 1, 2]);
    }

    #[test]
    fn same_input_same_output() {
        let a = stats(vec![3, 9, 2, 7, 1, 5], vec![1, 2, 3, 4, 5, 6]);
        let coord = ExchangeCoordinator::new(10, Some(9), Some(2));
        let first = coord.estimate_partition_start_indices(&[&a]).expect("starts");
        let second = coord.estimate_partition_start_indices(&[&a]).expect("starts");
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_mismatched_partition_counts() {
        let a = stats(vec![1, 2], vec![1, 1]);
        let b = stats(vec![1, 2, 3], vec![1, 1, 1]);
        let coord = ExchangeCoordinator::new(100, None, None);
        let err = coord
            .estimate_partition_start_indices(&[&a, &b])
            .expect_err("mismatch");
        assert!(matches!(err, SfError::Coordinator(_)));
    }

    #[test]
    fn skewed_ids_are_never_inside_ranges() {
        let a = stats(vec![10, 10, 100, 10, 10], vec![1, 1, 50, 1, 1]);
        let skewed = BTreeSet::from([2_u32]);
        let coord = ExchangeCoordinator::new(25, None, None);
        let (starts, ends) = coord
            .estimate_partition_start_end_indices(&[&a], &skewed)
            .expect("ranges");
        assert_eq!(starts.len(), ends.len());
        let mut covered = BTreeSet::new();
        for (s, e) in starts.iter().zip(ends.iter()) {
            assert!(s < e);
            for r in *s..*e {
                assert!(!skewed.contains(&r));
                covered.insert(r);
            }
        }
        let expected: BTreeSet<u32> = (0..5).filter(|r| !skewed.contains(r)).collect();
        assert_eq!(covered, expected);
    }

    #[test]
    fn histogram_buckets_cover_all_reducers() {
        let a = stats(vec![1, 100_000, 2 * 1024 * 1024, 1], vec![1, 1, 1, 1]);
        let buckets = partition_bytes_histogram(&a);
        let total: u32 = buckets.iter().map(|b| b.partition_count).sum();
        assert_eq!(total, 4);
        assert!(buckets.windows(2).all(|w| {
            w[0].upper_bound_bytes < w[1].upper_bound_bytes
        }));
    }

    #[test]
    fn skew_gap_at_both_edges() {
        let a = stats(vec![1, 1, 1, 1], vec![1, 1, 1, 1]);
        let skewed = BTreeSet::from([0_u32, 3_u32]);
        let coord = ExchangeCoordinator::new(100, None, None);
        let (starts, ends) = coord
            .estimate_partition_start_end_indices(&[&a], &skewed)
            .expect("ranges");
        assert_eq!(starts, vec![1]);
        assert_eq!(ends, vec![3]);
    }
}
