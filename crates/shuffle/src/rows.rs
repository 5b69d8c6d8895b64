use arrow::array::Array;
use arrow::record_batch::RecordBatch;

use crate::store::ShuffleHandle;

/// Handle to a completed shuffle write, the artifact of a shuffle stage.
///
/// The rows themselves stay in the map-output store; downstream readers
/// combine this handle with partition ranges to pull them.
#[derive(Debug, Clone)]
pub struct ShuffledRowSet {
    /// Identity and dimensions of the registered shuffle.
    pub handle: ShuffleHandle,
}

/// Materialized result rows, one batch list per output partition.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    /// Output partitions in order.
    pub partitions: Vec<Vec<RecordBatch>>,
}

impl RowSet {
    /// Total row count across all partitions.
    pub fn num_rows(&self) -> usize {
        self.partitions
            .iter()
            .flat_map(|p| p.iter())
            .map(|b| b.num_rows())
            .sum()
    }
}

/// A relation replicated to every task, the artifact of a broadcast stage.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    /// The broadcast rows.
    pub batches: Vec<RecordBatch>,
    /// In-memory size of the broadcast value.
    pub size_in_bytes: u64,
}

impl BroadcastPayload {
    /// Wrap materialized batches, measuring their in-memory footprint.
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        let size_in_bytes = batches
            .iter()
            .map(|b| {
                b.columns()
                    .iter()
                    .map(|a| a.get_array_memory_size() as u64)
                    .sum::<u64>()
            })
            .sum();
        Self {
            batches,
            size_in_bytes,
        }
    }
}
