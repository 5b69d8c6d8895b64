use serde::{Deserialize, Serialize};
use stageflow_common::{Result, SfError};

/// Per-reducer byte and row counts emitted by a completed shuffle write.
///
/// Indexed by pre-shuffle partition id (reducer id); both vectors have length
/// `P`, the map-side reducer count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapOutputStatistics {
    /// Total output bytes per reducer id, summed over all mappers.
    pub bytes_by_partition: Vec<u64>,
    /// Total output rows per reducer id, summed over all mappers.
    pub rows_by_partition: Vec<u64>,
    /// Number of map tasks that produced output.
    pub num_mappers: u32,
}

impl MapOutputStatistics {
    /// Build statistics, validating that byte and row vectors agree on `P`.
    pub fn new(
        bytes_by_partition: Vec<u64>,
        rows_by_partition: Vec<u64>,
        num_mappers: u32,
    ) -> Result<Self> {
        if bytes_by_partition.len() != rows_by_partition.len() {
            return Err(SfError::Coordinator(format!(
                "byte and row vectors disagree on partition count: {} vs {}",
                bytes_by_partition.len(),
                rows_by_partition.len()
            )));
        }
        Ok(Self {
            bytes_by_partition,
            rows_by_partition,
            num_mappers,
        })
    }

    /// Pre-shuffle partition count `P`.
    pub fn num_partitions(&self) -> usize {
        self.bytes_by_partition.len()
    }

    /// Total map-output bytes across all reducers.
    pub fn total_bytes(&self) -> u64 {
        self.bytes_by_partition.iter().sum()
    }

    /// Total map-output rows across all reducers.
    pub fn total_rows(&self) -> u64 {
        self.rows_by_partition.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::MapOutputStatistics;

    #[test]
    fn totals_sum_over_reducers() {
        let stats =
            MapOutputStatistics::new(vec![10, 20, 30], vec![1, 2, 3], 4).expect("stats");
        assert_eq!(stats.num_partitions(), 3);
        assert_eq!(stats.total_bytes(), 60);
        assert_eq!(stats.total_rows(), 6);
    }

    #[test]
    fn rejects_mismatched_vectors() {
        assert!(MapOutputStatistics::new(vec![1], vec![1, 2], 1).is_err());
    }
}
