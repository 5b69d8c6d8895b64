//! Runtime demotion of sort-merge joins to broadcast-hash joins.
//!
//! Contract:
//! - a side is buildable when its join type admits building it and its
//!   materialized size fits under the broadcast threshold, right side
//!   preferred;
//! - a candidate is committed only if, after exchange insertion, the plan
//!   carries no more shuffles than the enclosing stage tolerates;
//! - stream-side shuffle inputs of a committed broadcast join switch to
//!   local reads.

use stageflow_common::metrics::global_metrics;
use stageflow_common::AdaptiveConfig;
use stageflow_plan::{
    count_shuffle_exchanges, ensure_requirements, BroadcastHashJoinExec, BuildSide, JoinType,
    PlanNode, SortMergeJoinExec, StageKind,
};
use tracing::{debug, info};

/// Demote broadcastable sort-merge joins inside a stage's child plan.
///
/// Returns the rewritten plan and whether anything changed.
pub fn optimize_join(
    plan: PlanNode,
    stage_kind: StageKind,
    config: &AdaptiveConfig,
    shuffle_partitions: usize,
) -> (PlanNode, bool) {
    if !config.adaptive_join_enabled {
        return (plan, false);
    }
    let mut plan = plan;
    let mut changed = false;
    // Every acceptance removes one sort-merge join, so this terminates.
    'outer: loop {
        let paths = sort_merge_join_paths(&plan);
        for path in paths {
            if let Some(next) = try_demote(&plan, &path, stage_kind, config, shuffle_partitions) {
                plan = next;
                changed = true;
                continue 'outer;
            }
        }
        break;
    }
    (plan, changed)
}

// Paths of every sort-merge join, deepest first.
fn sort_merge_join_paths(plan: &PlanNode) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    walk(plan, &mut Vec::new(), &mut out);
    out
}

fn walk(plan: &PlanNode, path: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    for (i, child) in plan.children().into_iter().enumerate() {
        path.push(i);
        walk(child, path, out);
        path.pop();
    }
    if matches!(plan, PlanNode::SortMergeJoin(_)) {
        out.push(path.clone());
    }
}

fn node_at<'a>(plan: &'a PlanNode, path: &[usize]) -> &'a PlanNode {
    let mut node = plan;
    for idx in path {
        node = node.children()[*idx];
    }
    node
}

fn replace_at(plan: &PlanNode, path: &[usize], replacement: PlanNode) -> PlanNode {
    let Some((idx, rest)) = path.split_first() else {
        return replacement;
    };
    let new_child = replace_at(plan.children()[*idx], rest, replacement);
    plan.clone().replace_child(*idx, new_child)
}

fn try_demote(
    plan: &PlanNode,
    path: &[usize],
    stage_kind: StageKind,
    config: &AdaptiveConfig,
    shuffle_partitions: usize,
) -> Option<PlanNode> {
    let PlanNode::SortMergeJoin(smj) = node_at(plan, path) else {
        return None;
    };
    let build_side = choose_build_side(smj, config)?;

    let candidate = PlanNode::BroadcastHashJoin(BroadcastHashJoinExec {
        left_keys: smj.left_keys.clone(),
        right_keys: smj.right_keys.clone(),
        join_type: smj.join_type,
        condition: smj.condition.clone(),
        build_side,
        // The sorts below the join were only there for the merge.
        left: Box::new(strip_sorts(smj.left.as_ref().clone())),
        right: Box::new(strip_sorts(smj.right.as_ref().clone())),
    });

    let grafted = replace_at(plan, path, candidate);
    let ensured = ensure_requirements(grafted, shuffle_partitions);
    let remaining = count_shuffle_exchanges(&ensured);
    let tolerated = match stage_kind {
        // A shuffle stage keeps its own final exchange at the root.
        StageKind::Shuffle => 1,
        StageKind::Broadcast | StageKind::Result => 0,
    };
    if remaining > tolerated {
        debug!(
            remaining,
            tolerated, "broadcast demotion rejected: residual shuffles"
        );
        return None;
    }

    info!(?build_side, join_type = ?smj.join_type, "demoted sort-merge join to broadcast-hash join");
    global_metrics().inc_broadcast_demotion();
    Some(mark_local_under_broadcast_joins(ensured))
}

fn choose_build_side(smj: &SortMergeJoinExec, config: &AdaptiveConfig) -> Option<BuildSide> {
    let threshold = config.adaptive_broadcast_join_threshold;
    let right_fits = smj
        .right
        .estimated_size_in_bytes()
        .is_some_and(|s| s <= threshold);
    let left_fits = smj
        .left
        .estimated_size_in_bytes()
        .is_some_and(|s| s <= threshold);
    if can_build_right(smj.join_type) && right_fits {
        Some(BuildSide::Right)
    } else if can_build_left(smj.join_type) && left_fits {
        Some(BuildSide::Left)
    } else {
        None
    }
}

fn can_build_right(join_type: JoinType) -> bool {
    matches!(
        join_type,
        JoinType::Inner
            | JoinType::LeftOuter
            | JoinType::LeftSemi
            | JoinType::LeftAnti
            | JoinType::Existence
    )
}

fn can_build_left(join_type: JoinType) -> bool {
    matches!(join_type, JoinType::Inner | JoinType::RightOuter)
}

fn strip_sorts(plan: PlanNode) -> PlanNode {
    let mut node = plan;
    while let PlanNode::Sort(sort) = node {
        node = *sort.input;
    }
    node
}

// The broadcast removed the shuffle dependency of the stream side; its stage
// inputs read one mapper at a time instead.
fn mark_local_under_broadcast_joins(plan: PlanNode) -> PlanNode {
    match plan.map_children(&mut mark_local_under_broadcast_joins) {
        PlanNode::BroadcastHashJoin(mut join) => {
            for side in [&mut join.left, &mut join.right] {
                if let PlanNode::ShuffleStageInput(input) = side.as_mut() {
                    input.is_local_shuffle = true;
                }
            }
            PlanNode::BroadcastHashJoin(join)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::DataType;
    use stageflow_common::StageId;
    use stageflow_plan::{
        Attribute, ExchangeExec, Partitioning, PlanStats, QueryStage, ScanExec,
        ShuffleExchangeExec, ShuffleStageInputExec, SortExec, SortOrder,
    };
    use stageflow_shuffle::MapOutputStatistics;

    use super::*;

    fn shuffle_stage(
        id: u64,
        table: &str,
        bytes: Vec<u64>,
        num_mappers: u32,
    ) -> (Arc<QueryStage>, Vec<Attribute>) {
        let key = Attribute::new("k", DataType::Int64);
        let output = vec![key.clone(), Attribute::new("v", DataType::Int64)];
        let partitions = bytes.len();
        let exchange = PlanNode::Exchange(ExchangeExec::Shuffle(ShuffleExchangeExec {
            partitioning: Partitioning::HashKeys {
                keys: vec![key],
                partitions,
            },
            input: Box::new(PlanNode::Scan(ScanExec {
                table: table.to_string(),
                output: output.clone(),
                stats: PlanStats::default(),
                partitions: num_mappers as usize,
            })),
        }));
        let stage = QueryStage::shuffle(StageId(id), exchange);
        let rows = vec![1_u64; bytes.len()];
        stage
            .set_statistics(MapOutputStatistics::new(bytes, rows, num_mappers).expect("stats"))
            .expect("first assignment");
        (stage, output)
    }

    fn sorted_input(stage: Arc<QueryStage>, output: Vec<Attribute>) -> (PlanNode, Attribute) {
        let key = output[0].clone();
        let node = PlanNode::Sort(SortExec {
            order: vec![SortOrder::asc(key.clone())],
            global: false,
            input: Box::new(PlanNode::ShuffleStageInput(ShuffleStageInputExec::new(
                stage, output,
            ))),
        });
        (node, key)
    }

    fn smj_over_stages(left_bytes: Vec<u64>, right_bytes: Vec<u64>) -> PlanNode {
        let (left_stage, left_out) = shuffle_stage(0, "a", left_bytes, 4);
        let (right_stage, right_out) = shuffle_stage(1, "b", right_bytes, 4);
        let (left, lk) = sorted_input(left_stage, left_out);
        let (right, rk) = sorted_input(right_stage, right_out);
        PlanNode::SortMergeJoin(SortMergeJoinExec {
            left_keys: vec![lk],
            right_keys: vec![rk],
            join_type: JoinType::Inner,
            condition: None,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn config_with_threshold(threshold: u64) -> AdaptiveConfig {
        AdaptiveConfig {
            adaptive_broadcast_join_threshold: threshold,
            ..AdaptiveConfig::default()
        }
    }

    #[test]
    fn demotes_small_right_side_and_marks_stream_local() {
        let plan = smj_over_stages(vec![1000, 1000], vec![10, 10]);
        let (plan, changed) =
            optimize_join(plan, StageKind::Result, &config_with_threshold(100), 4);
        assert!(changed);

        let PlanNode::BroadcastHashJoin(join) = &plan else {
            panic!("expected broadcast-hash join root, got {plan:?}");
        };
        assert_eq!(join.build_side, BuildSide::Right);
        // Sorts were only required by the merge and are gone.
        let PlanNode::ShuffleStageInput(stream) = join.left.as_ref() else {
            panic!("expected bare stream-side stage input");
        };
        assert!(stream.is_local_shuffle);
        // The build side reads the shuffle output through a broadcast.
        let PlanNode::Exchange(ExchangeExec::Broadcast(b)) = join.right.as_ref() else {
            panic!("expected broadcast exchange on build side");
        };
        assert!(matches!(
            b.input.as_ref(),
            PlanNode::ShuffleStageInput(i) if !i.is_local_shuffle
        ));
        assert_eq!(count_shuffle_exchanges(&plan), 0);
    }

    #[test]
    fn shuffle_stage_tolerates_its_own_root_exchange() {
        let join = smj_over_stages(vec![1000, 1000], vec![10, 10]);
        let key = join.output()[0].clone();
        let staged = PlanNode::Exchange(ExchangeExec::Shuffle(ShuffleExchangeExec {
            partitioning: Partitioning::HashKeys {
                keys: vec![key],
                partitions: 4,
            },
            input: Box::new(join),
        }));

        let (rejected, changed) = optimize_join(
            staged.clone(),
            StageKind::Result,
            &config_with_threshold(100),
            4,
        );
        assert!(!changed);
        assert_eq!(count_shuffle_exchanges(&rejected), 1);

        let (accepted, changed) =
            optimize_join(staged, StageKind::Shuffle, &config_with_threshold(100), 4);
        assert!(changed);
        assert_eq!(count_shuffle_exchanges(&accepted), 1);
    }

    #[test]
    fn oversized_sides_stay_sort_merge() {
        let plan = smj_over_stages(vec![1000, 1000], vec![900, 900]);
        let (plan, changed) =
            optimize_join(plan, StageKind::Result, &config_with_threshold(100), 4);
        assert!(!changed);
        assert!(matches!(plan, PlanNode::SortMergeJoin(_)));
    }

    #[test]
    fn disabled_gate_is_identity() {
        let plan = smj_over_stages(vec![1000, 1000], vec![10, 10]);
        let config = AdaptiveConfig {
            adaptive_join_enabled: false,
            ..config_with_threshold(100)
        };
        let (plan, changed) = optimize_join(plan, StageKind::Result, &config, 4);
        assert!(!changed);
        assert!(matches!(plan, PlanNode::SortMergeJoin(_)));
    }

    #[test]
    fn right_outer_join_builds_left() {
        let plan = smj_over_stages(vec![10, 10], vec![1000, 1000]);
        let PlanNode::SortMergeJoin(mut smj) = plan else {
            unreachable!()
        };
        smj.join_type = JoinType::RightOuter;
        let (plan, changed) = optimize_join(
            PlanNode::SortMergeJoin(smj),
            StageKind::Result,
            &config_with_threshold(100),
            4,
        );
        assert!(changed);
        let PlanNode::BroadcastHashJoin(join) = &plan else {
            panic!("expected broadcast-hash join root");
        };
        assert_eq!(join.build_side, BuildSide::Left);
    }
}
