//! Runtime splitting of skewed sort-merge joins.
//!
//! Contract:
//! - runs only on plans carrying exactly two shuffle stage inputs (two-way
//!   joins);
//! - a reducer id is skewed when its bytes or rows exceed both the median
//!   times the configured factor and the absolute floor;
//! - every handled reducer id turns into sub-joins whose left mapper ranges
//!   cover `[0, num_mappers)` exactly; the right side is read whole per
//!   sub-join;
//! - the original join keeps the non-skewed ranges, which the exchange
//!   coordinator routes around the handled ids.

use std::collections::BTreeSet;

use stageflow_common::metrics::global_metrics;
use stageflow_common::AdaptiveConfig;
use stageflow_plan::{
    JoinType, PlanNode, ShuffleStageInputExec, SkewedShuffleStageInputExec, SortExec,
    SortMergeJoinExec, UnionExec,
};
use stageflow_shuffle::MapOutputStatistics;
use tracing::info;

// Hard cap on sub-joins per skewed reducer id.
const MAX_SPLITS_PER_PARTITION: u64 = 5;

/// Split skewed two-way sort-merge joins into unions of sub-range joins.
///
/// Returns the rewritten plan and whether anything changed.
pub fn handle_skewed_join(plan: PlanNode, config: &AdaptiveConfig) -> (PlanNode, bool) {
    if !config.adaptive_skewed_join_enabled {
        return (plan, false);
    }
    if plan.shuffle_stage_inputs().len() != 2 {
        return (plan, false);
    }
    let mut changed = false;
    let plan = rewrite(plan, config, &mut changed);
    (plan, changed)
}

fn rewrite(plan: PlanNode, config: &AdaptiveConfig, changed: &mut bool) -> PlanNode {
    let plan = plan.map_children(&mut |c| rewrite(c, config, changed));
    match plan {
        PlanNode::SortMergeJoin(smj)
            if matches!(
                smj.join_type,
                JoinType::Inner | JoinType::Cross | JoinType::LeftSemi
            ) =>
        {
            match split_skewed_join(&smj, config) {
                Some(node) => {
                    *changed = true;
                    node
                }
                None => PlanNode::SortMergeJoin(smj),
            }
        }
        other => other,
    }
}

fn split_skewed_join(smj: &SortMergeJoinExec, config: &AdaptiveConfig) -> Option<PlanNode> {
    let (left_sort, left_input) = sorted_shuffle_input(&smj.left)?;
    let (right_sort, right_input) = sorted_shuffle_input(&smj.right)?;
    let left_stats = left_input.stage.statistics()?;
    let right_stats = right_input.stage.statistics()?;
    let left_mappers = left_stats.num_mappers;
    let right_mappers = right_stats.num_mappers;
    if left_mappers == 0 || right_mappers == 0 {
        return None;
    }

    let mut handled = skewed_partitions(left_stats, config);
    handled.extend(skewed_partitions(right_stats, config));
    if handled.is_empty() {
        return None;
    }

    let mut sub_joins = Vec::new();
    for &partition in &handled {
        let num_split = split_count(left_stats, partition as usize, left_mappers);
        let step = left_mappers / num_split;
        for i in 0..num_split {
            let map_start = i * step;
            let map_end = if i == num_split - 1 {
                left_mappers
            } else {
                (i + 1) * step
            };
            let left_leaf = PlanNode::SkewedShuffleStageInput(SkewedShuffleStageInputExec {
                stage: left_input.stage.clone(),
                output: left_input.output.clone(),
                partition_id: partition,
                start_map_id: map_start,
                end_map_id: map_end,
            });
            // The right side is read in full per reducer and replicated
            // across the split group.
            let right_leaf = PlanNode::SkewedShuffleStageInput(SkewedShuffleStageInputExec {
                stage: right_input.stage.clone(),
                output: right_input.output.clone(),
                partition_id: partition,
                start_map_id: 0,
                end_map_id: right_mappers,
            });
            sub_joins.push(PlanNode::SortMergeJoin(SortMergeJoinExec {
                left_keys: smj.left_keys.clone(),
                right_keys: smj.right_keys.clone(),
                join_type: smj.join_type,
                condition: smj.condition.clone(),
                left: Box::new(PlanNode::Sort(SortExec {
                    order: left_sort.order.clone(),
                    global: false,
                    input: Box::new(left_leaf),
                })),
                right: Box::new(PlanNode::Sort(SortExec {
                    order: right_sort.order.clone(),
                    global: false,
                    input: Box::new(right_leaf),
                })),
            }));
        }
    }

    info!(
        partitions = handled.len(),
        sub_joins = sub_joins.len(),
        "split skewed sort-merge join"
    );
    global_metrics().add_skew_splits(sub_joins.len() as u64);

    // The original join keeps the complementary non-skewed ranges.
    let original = PlanNode::SortMergeJoin(SortMergeJoinExec {
        left_keys: smj.left_keys.clone(),
        right_keys: smj.right_keys.clone(),
        join_type: smj.join_type,
        condition: smj.condition.clone(),
        left: Box::new(PlanNode::Sort(SortExec {
            order: left_sort.order.clone(),
            global: left_sort.global,
            input: Box::new(PlanNode::ShuffleStageInput(with_skewed_set(
                left_input, &handled,
            ))),
        })),
        right: Box::new(PlanNode::Sort(SortExec {
            order: right_sort.order.clone(),
            global: right_sort.global,
            input: Box::new(PlanNode::ShuffleStageInput(with_skewed_set(
                right_input, &handled,
            ))),
        })),
    });

    let mut children = vec![original];
    children.extend(sub_joins);
    Some(PlanNode::Union(UnionExec { children }))
}

fn sorted_shuffle_input(node: &PlanNode) -> Option<(&SortExec, &ShuffleStageInputExec)> {
    let PlanNode::Sort(sort) = node else {
        return None;
    };
    let PlanNode::ShuffleStageInput(input) = sort.input.as_ref() else {
        return None;
    };
    Some((sort, input))
}

fn with_skewed_set(
    input: &ShuffleStageInputExec,
    handled: &BTreeSet<u32>,
) -> ShuffleStageInputExec {
    let mut out = input.clone();
    out.skewed_partitions = Some(handled.clone());
    out
}

fn skewed_partitions(stats: &MapOutputStatistics, config: &AdaptiveConfig) -> BTreeSet<u32> {
    let median_bytes = median(&stats.bytes_by_partition);
    let median_rows = median(&stats.rows_by_partition);
    let mut out = BTreeSet::new();
    for p in 0..stats.num_partitions() {
        let bytes = stats.bytes_by_partition[p];
        let rows = stats.rows_by_partition[p];
        let by_bytes = bytes as f64 > median_bytes as f64 * config.skewed_factor
            && bytes > config.skewed_size_threshold;
        let by_rows = rows as f64 > median_rows as f64 * config.skewed_factor
            && rows > config.skewed_row_count_threshold;
        if by_bytes || by_rows {
            out.insert(p as u32);
        }
    }
    out
}

// Upper median of the per-reducer values.
fn median(values: &[u64]) -> u64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

// Never more than the cap, never more than one split per mapper, never less
// than one sub-join per handled partition.
fn split_count(stats: &MapOutputStatistics, partition: usize, num_mappers: u32) -> u32 {
    let median_bytes = median(&stats.bytes_by_partition).max(1);
    let median_rows = median(&stats.rows_by_partition).max(1);
    let by_size = stats.bytes_by_partition[partition] / median_bytes;
    let by_rows = stats.rows_by_partition[partition] / median_rows;
    MAX_SPLITS_PER_PARTITION
        .min(by_size.min(by_rows))
        .min(u64::from(num_mappers))
        .max(1) as u32
}
