use serde::{Deserialize, Serialize};

/// Adaptive-execution configuration shared across planner/runtime layers.
///
/// All values are read once at the start of a query and never re-read while
/// the query runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Gate for the whole adaptive system; off means the stage planner is an
    /// identity transform.
    #[serde(default = "default_true")]
    pub adaptive_execution_enabled: bool,
    /// Enables runtime sort-merge to broadcast-hash join demotion.
    #[serde(default = "default_true")]
    pub adaptive_join_enabled: bool,
    /// Enables runtime skewed-join splitting.
    #[serde(default = "default_true")]
    pub adaptive_skewed_join_enabled: bool,

    /// Byte target per coalesced post-shuffle partition.
    pub target_post_shuffle_input_size: u64,
    /// Optional row target per coalesced post-shuffle partition.
    #[serde(default)]
    pub target_post_shuffle_row_count: Option<u64>,
    /// Optional lower bound on the number of coalesced groups.
    #[serde(default)]
    pub min_num_post_shuffle_partitions: Option<u32>,

    /// Size cutoff below which a shuffled join side is demoted to broadcast.
    pub adaptive_broadcast_join_threshold: u64,

    /// Skew detection multiplier over the median partition size.
    pub skewed_factor: f64,
    /// Absolute byte floor a partition must exceed to count as skewed.
    pub skewed_size_threshold: u64,
    /// Absolute row floor a partition must exceed to count as skewed.
    pub skewed_row_count_threshold: u64,
}

fn default_true() -> bool {
    true
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            adaptive_execution_enabled: true,
            adaptive_join_enabled: true,
            adaptive_skewed_join_enabled: true,
            target_post_shuffle_input_size: 64 * 1024 * 1024,
            target_post_shuffle_row_count: None,
            min_num_post_shuffle_partitions: None,
            adaptive_broadcast_join_threshold: 64 * 1024 * 1024,
            skewed_factor: 10.0,
            skewed_size_threshold: 64 * 1024 * 1024,
            skewed_row_count_threshold: 10_000_000,
        }
    }
}
