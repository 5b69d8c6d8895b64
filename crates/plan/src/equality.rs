//! Semantic plan equality modulo attribute renaming.
//!
//! Two plans are considered equal when they compute the same result even if
//! their attribute ids differ; the comparison threads an id-translation map
//! populated at the leaves.

use std::collections::HashMap;

use stageflow_common::AttrId;

use crate::attr::Attribute;
use crate::expr::Expr;
use crate::node::{ExchangeExec, PlanNode};
use crate::partitioning::{Partitioning, SortOrder};

/// Whether `a` and `b` produce the same result modulo attribute renaming.
pub fn same_result(a: &PlanNode, b: &PlanNode) -> bool {
    let mut map = HashMap::new();
    eq_node(a, b, &mut map)
}

fn eq_node(a: &PlanNode, b: &PlanNode, m: &mut HashMap<AttrId, AttrId>) -> bool {
    match (a, b) {
        (PlanNode::Scan(x), PlanNode::Scan(y)) => {
            x.table == y.table && x.partitions == y.partitions && eq_outputs(&x.output, &y.output, m)
        }
        (PlanNode::Sort(x), PlanNode::Sort(y)) => {
            x.global == y.global && eq_node(&x.input, &y.input, m) && eq_orders(&x.order, &y.order, m)
        }
        (PlanNode::SortMergeJoin(x), PlanNode::SortMergeJoin(y)) => {
            x.join_type == y.join_type
                && eq_node(&x.left, &y.left, m)
                && eq_node(&x.right, &y.right, m)
                && eq_keys(&x.left_keys, &y.left_keys, m)
                && eq_keys(&x.right_keys, &y.right_keys, m)
                && eq_condition(&x.condition, &y.condition, m)
        }
        (PlanNode::BroadcastHashJoin(x), PlanNode::BroadcastHashJoin(y)) => {
            x.join_type == y.join_type
                && x.build_side == y.build_side
                && eq_node(&x.left, &y.left, m)
                && eq_node(&x.right, &y.right, m)
                && eq_keys(&x.left_keys, &y.left_keys, m)
                && eq_keys(&x.right_keys, &y.right_keys, m)
                && eq_condition(&x.condition, &y.condition, m)
        }
        (PlanNode::Union(x), PlanNode::Union(y)) => {
            x.children.len() == y.children.len()
                && x.children
                    .iter()
                    .zip(y.children.iter())
                    .all(|(xc, yc)| eq_node(xc, yc, m))
        }
        (PlanNode::Write(x), PlanNode::Write(y)) => {
            x.table == y.table && eq_node(&x.input, &y.input, m)
        }
        (
            PlanNode::Exchange(ExchangeExec::Shuffle(x)),
            PlanNode::Exchange(ExchangeExec::Shuffle(y)),
        ) => eq_node(&x.input, &y.input, m) && eq_partitioning(&x.partitioning, &y.partitioning, m),
        (
            PlanNode::Exchange(ExchangeExec::Broadcast(x)),
            PlanNode::Exchange(ExchangeExec::Broadcast(y)),
        ) => eq_node(&x.input, &y.input, m),
        (PlanNode::ShuffleStageInput(x), PlanNode::ShuffleStageInput(y)) => {
            x.stage.id() == y.stage.id()
                && x.is_local_shuffle == y.is_local_shuffle
                && eq_outputs(&x.output, &y.output, m)
        }
        (PlanNode::SkewedShuffleStageInput(x), PlanNode::SkewedShuffleStageInput(y)) => {
            x.stage.id() == y.stage.id()
                && x.partition_id == y.partition_id
                && x.start_map_id == y.start_map_id
                && x.end_map_id == y.end_map_id
                && eq_outputs(&x.output, &y.output, m)
        }
        (PlanNode::BroadcastStageInput(x), PlanNode::BroadcastStageInput(y)) => {
            x.stage.id() == y.stage.id() && eq_outputs(&x.output, &y.output, m)
        }
        _ => false,
    }
}

// Leaf outputs define the id translation; conflicting re-mappings fail the
// comparison.
fn eq_outputs(a: &[Attribute], b: &[Attribute], m: &mut HashMap<AttrId, AttrId>) -> bool {
    if a.len() != b.len() {
        return false;
    }
    for (x, y) in a.iter().zip(b.iter()) {
        if x.name != y.name || x.data_type != y.data_type {
            return false;
        }
        match m.get(&x.id) {
            Some(mapped) if *mapped != y.id => return false,
            Some(_) => {}
            None => {
                m.insert(x.id, y.id);
            }
        }
    }
    true
}

fn eq_attr_ref(a: &Attribute, b: &Attribute, m: &HashMap<AttrId, AttrId>) -> bool {
    match m.get(&a.id) {
        Some(mapped) => *mapped == b.id,
        None => a.id == b.id,
    }
}

fn eq_keys(a: &[Attribute], b: &[Attribute], m: &HashMap<AttrId, AttrId>) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| eq_attr_ref(x, y, m))
}

fn eq_orders(a: &[SortOrder], b: &[SortOrder], m: &HashMap<AttrId, AttrId>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.descending == y.descending && eq_attr_ref(&x.key, &y.key, m))
}

fn eq_partitioning(a: &Partitioning, b: &Partitioning, m: &HashMap<AttrId, AttrId>) -> bool {
    match (a, b) {
        (
            Partitioning::HashKeys {
                keys: ka,
                partitions: pa,
            },
            Partitioning::HashKeys {
                keys: kb,
                partitions: pb,
            },
        ) => pa == pb && eq_keys(ka, kb, m),
        (Partitioning::Single, Partitioning::Single) => true,
        (Partitioning::Broadcast, Partitioning::Broadcast) => true,
        (Partitioning::Unknown { partitions: pa }, Partitioning::Unknown { partitions: pb }) => {
            pa == pb
        }
        _ => false,
    }
}

fn eq_condition(a: &Option<Expr>, b: &Option<Expr>, m: &HashMap<AttrId, AttrId>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => eq_expr(x, y, m),
        _ => false,
    }
}

fn eq_expr(a: &Expr, b: &Expr, m: &HashMap<AttrId, AttrId>) -> bool {
    match (a, b) {
        (Expr::Column(x), Expr::Column(y)) => eq_attr_ref(x, y, m),
        (Expr::Literal(x), Expr::Literal(y)) => x == y,
        (
            Expr::BinaryOp {
                left: la,
                op: oa,
                right: ra,
            },
            Expr::BinaryOp {
                left: lb,
                op: ob,
                right: rb,
            },
        ) => oa == ob && eq_expr(la, lb, m) && eq_expr(ra, rb, m),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;

    use super::*;
    use crate::node::{PlanStats, ScanExec, ShuffleExchangeExec};

    fn scan(table: &str) -> PlanNode {
        PlanNode::Scan(ScanExec {
            table: table.to_string(),
            output: vec![
                Attribute::new("k", DataType::Int64),
                Attribute::new("v", DataType::Int64),
            ],
            stats: PlanStats::default(),
            partitions: 2,
        })
    }

    fn shuffle_on_first_key(input: PlanNode) -> PlanNode {
        let key = input.output()[0].clone();
        PlanNode::Exchange(ExchangeExec::Shuffle(ShuffleExchangeExec {
            partitioning: Partitioning::HashKeys {
                keys: vec![key],
                partitions: 4,
            },
            input: Box::new(input),
        }))
    }

    #[test]
    fn renamed_scans_compare_equal() {
        assert!(same_result(&scan("t"), &scan("t")));
        assert!(!same_result(&scan("t"), &scan("u")));
    }

    #[test]
    fn exchanges_compare_modulo_attribute_ids() {
        let a = shuffle_on_first_key(scan("t"));
        let b = shuffle_on_first_key(scan("t"));
        assert!(same_result(&a, &b));
    }

    #[test]
    fn partition_count_differences_break_equality() {
        let a = shuffle_on_first_key(scan("t"));
        let PlanNode::Exchange(ExchangeExec::Shuffle(mut y)) = shuffle_on_first_key(scan("t"))
        else {
            unreachable!()
        };
        y.partitioning = Partitioning::HashKeys {
            keys: match &y.partitioning {
                Partitioning::HashKeys { keys, .. } => keys.clone(),
                _ => unreachable!(),
            },
            partitions: 8,
        };
        let b = PlanNode::Exchange(ExchangeExec::Shuffle(y));
        assert!(!same_result(&a, &b));
    }

    #[test]
    fn key_position_matters() {
        let base = scan("t");
        let other_key = base.output()[1].clone();
        let a = shuffle_on_first_key(base.clone());
        let b = PlanNode::Exchange(ExchangeExec::Shuffle(ShuffleExchangeExec {
            partitioning: Partitioning::HashKeys {
                keys: vec![other_key],
                partitions: 4,
            },
            input: Box::new(base),
        }));
        assert!(!same_result(&a, &b));
    }
}
