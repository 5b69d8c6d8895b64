//! Exchange and sort insertion.
//!
//! Contract:
//! - bottom-up; children are fixed before their parent's requirements;
//! - idempotent: a child whose layout/ordering already satisfies the parent
//!   is left untouched;
//! - broadcast-hash joins never get a shuffle inserted on the stream side.

use crate::attr::Attribute;
use crate::node::{
    BroadcastExchangeExec, BuildSide, ExchangeExec, PlanNode, ShuffleExchangeExec, SortExec,
};
use crate::partitioning::{ordering_satisfied, Distribution, Partitioning, SortOrder};

/// Insert the exchanges and sorts required by operators in `plan`.
///
/// `shuffle_partitions` is the partition count used for newly inserted
/// shuffles.
pub fn ensure_requirements(plan: PlanNode, shuffle_partitions: usize) -> PlanNode {
    match plan {
        PlanNode::Sort(mut x) => {
            x.input = Box::new(ensure_requirements(*x.input, shuffle_partitions));
            PlanNode::Sort(x)
        }
        PlanNode::SortMergeJoin(mut x) => {
            let left = ensure_requirements(*x.left, shuffle_partitions);
            let right = ensure_requirements(*x.right, shuffle_partitions);
            let left = ensure_distribution(
                left,
                &Distribution::HashClustered(x.left_keys.clone()),
                shuffle_partitions,
            );
            let right = ensure_distribution(
                right,
                &Distribution::HashClustered(x.right_keys.clone()),
                shuffle_partitions,
            );
            let (left, right) = align_partition_counts(left, right, &x.right_keys);
            x.left = Box::new(ensure_ordering(left, &x.left_keys));
            x.right = Box::new(ensure_ordering(right, &x.right_keys));
            PlanNode::SortMergeJoin(x)
        }
        PlanNode::BroadcastHashJoin(mut x) => {
            let left = ensure_requirements(*x.left, shuffle_partitions);
            let right = ensure_requirements(*x.right, shuffle_partitions);
            let (left, right) = match x.build_side {
                BuildSide::Right => (
                    left,
                    ensure_distribution(right, &Distribution::Broadcast, shuffle_partitions),
                ),
                BuildSide::Left => (
                    ensure_distribution(left, &Distribution::Broadcast, shuffle_partitions),
                    right,
                ),
            };
            x.left = Box::new(left);
            x.right = Box::new(right);
            PlanNode::BroadcastHashJoin(x)
        }
        PlanNode::Union(mut x) => {
            x.children = x
                .children
                .into_iter()
                .map(|c| ensure_requirements(c, shuffle_partitions))
                .collect();
            PlanNode::Union(x)
        }
        PlanNode::Write(mut x) => {
            x.input = Box::new(ensure_requirements(*x.input, shuffle_partitions));
            PlanNode::Write(x)
        }
        PlanNode::Exchange(ExchangeExec::Shuffle(mut x)) => {
            x.input = Box::new(ensure_requirements(*x.input, shuffle_partitions));
            PlanNode::Exchange(ExchangeExec::Shuffle(x))
        }
        PlanNode::Exchange(ExchangeExec::Broadcast(mut x)) => {
            x.input = Box::new(ensure_requirements(*x.input, shuffle_partitions));
            PlanNode::Exchange(ExchangeExec::Broadcast(x))
        }
        leaf => leaf,
    }
}

fn ensure_distribution(
    child: PlanNode,
    required: &Distribution,
    shuffle_partitions: usize,
) -> PlanNode {
    if child.output_partitioning().satisfies(required) {
        return child;
    }
    match required {
        Distribution::HashClustered(keys) => {
            PlanNode::Exchange(ExchangeExec::Shuffle(ShuffleExchangeExec {
                partitioning: Partitioning::HashKeys {
                    keys: keys.clone(),
                    partitions: shuffle_partitions.max(1),
                },
                input: Box::new(child),
            }))
        }
        Distribution::Broadcast => PlanNode::Exchange(ExchangeExec::Broadcast(
            BroadcastExchangeExec {
                input: Box::new(child),
            },
        )),
        Distribution::Single | Distribution::Unspecified => child,
    }
}

// Co-partitioning: both join sides must agree on the partition count. The
// right side is re-shuffled to the left's count on mismatch.
fn align_partition_counts(
    left: PlanNode,
    right: PlanNode,
    right_keys: &[Attribute],
) -> (PlanNode, PlanNode) {
    let ln = left.output_partitioning().num_partitions();
    let rn = right.output_partitioning().num_partitions();
    if ln == rn || ln == 0 || rn == 0 {
        return (left, right);
    }
    let right = PlanNode::Exchange(ExchangeExec::Shuffle(ShuffleExchangeExec {
        partitioning: Partitioning::HashKeys {
            keys: right_keys.to_vec(),
            partitions: ln,
        },
        input: Box::new(right),
    }));
    (left, right)
}

fn ensure_ordering(child: PlanNode, keys: &[Attribute]) -> PlanNode {
    let required = keys
        .iter()
        .cloned()
        .map(SortOrder::asc)
        .collect::<Vec<_>>();
    if ordering_satisfied(&child.output_ordering(), &required) {
        return child;
    }
    PlanNode::Sort(SortExec {
        order: required,
        global: false,
        input: Box::new(child),
    })
}

/// Number of shuffle exchanges in `plan`, stage inputs treated as leaves.
pub fn count_shuffle_exchanges(plan: &PlanNode) -> usize {
    let own = usize::from(matches!(plan, PlanNode::Exchange(ExchangeExec::Shuffle(_))));
    own + plan
        .children()
        .iter()
        .map(|c| count_shuffle_exchanges(c))
        .sum::<usize>()
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;

    use super::*;
    use crate::attr::Attribute;
    use crate::node::{JoinType, PlanStats, ScanExec, SortMergeJoinExec};

    fn scan(table: &str) -> (PlanNode, Attribute) {
        let key = Attribute::new("k", DataType::Int64);
        let node = PlanNode::Scan(ScanExec {
            table: table.to_string(),
            output: vec![key.clone()],
            stats: PlanStats::default(),
            partitions: 2,
        });
        (node, key)
    }

    fn smj(left: PlanNode, lk: Attribute, right: PlanNode, rk: Attribute) -> PlanNode {
        PlanNode::SortMergeJoin(SortMergeJoinExec {
            left_keys: vec![lk],
            right_keys: vec![rk],
            join_type: JoinType::Inner,
            condition: None,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    #[test]
    fn inserts_shuffles_and_sorts_under_smj() {
        let (l, lk) = scan("a");
        let (r, rk) = scan("b");
        let plan = ensure_requirements(smj(l, lk, r, rk), 4);
        assert_eq!(count_shuffle_exchanges(&plan), 2);
        let PlanNode::SortMergeJoin(j) = &plan else {
            panic!("expected join root");
        };
        assert!(matches!(j.left.as_ref(), PlanNode::Sort(_)));
        assert!(matches!(j.right.as_ref(), PlanNode::Sort(_)));
    }

    #[test]
    fn is_idempotent() {
        let (l, lk) = scan("a");
        let (r, rk) = scan("b");
        let once = ensure_requirements(smj(l, lk, r, rk), 4);
        let twice = ensure_requirements(once.clone(), 4);
        assert_eq!(count_shuffle_exchanges(&once), count_shuffle_exchanges(&twice));
    }
}
