use crate::attr::Attribute;
use crate::node::{ExchangeExec, PlanNode};
use crate::partitioning::{Partitioning, SortOrder};

/// Render a physical plan as human-readable multiline text.
///
/// Stage inputs print the hidden stage's current child plan indented below
/// them, so the adaptive-execution event stream shows the whole picture.
pub fn explain_plan(plan: &PlanNode) -> String {
    let mut s = String::new();
    fmt_plan(plan, 0, &mut s);
    s
}

fn fmt_plan(plan: &PlanNode, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        PlanNode::Scan(x) => {
            out.push_str(&format!(
                "{pad}Scan table={} partitions={}\n",
                x.table, x.partitions
            ));
        }
        PlanNode::Sort(x) => {
            out.push_str(&format!(
                "{pad}Sort global={} keys=[{}]\n",
                x.global,
                fmt_orders(&x.order)
            ));
            fmt_plan(&x.input, indent + 1, out);
        }
        PlanNode::SortMergeJoin(x) => {
            out.push_str(&format!(
                "{pad}SortMergeJoin type={:?} keys=[{}]\n",
                x.join_type,
                fmt_key_pairs(&x.left_keys, &x.right_keys)
            ));
            fmt_plan(&x.left, indent + 1, out);
            fmt_plan(&x.right, indent + 1, out);
        }
        PlanNode::BroadcastHashJoin(x) => {
            out.push_str(&format!(
                "{pad}BroadcastHashJoin type={:?} build={:?} keys=[{}]\n",
                x.join_type,
                x.build_side,
                fmt_key_pairs(&x.left_keys, &x.right_keys)
            ));
            fmt_plan(&x.left, indent + 1, out);
            fmt_plan(&x.right, indent + 1, out);
        }
        PlanNode::Union(x) => {
            out.push_str(&format!("{pad}Union\n"));
            for c in &x.children {
                fmt_plan(c, indent + 1, out);
            }
        }
        PlanNode::Write(x) => {
            out.push_str(&format!("{pad}Write table={}\n", x.table));
            fmt_plan(&x.input, indent + 1, out);
        }
        PlanNode::Exchange(ExchangeExec::Shuffle(x)) => {
            out.push_str(&format!(
                "{pad}ShuffleExchange {}\n",
                fmt_partitioning(&x.partitioning)
            ));
            fmt_plan(&x.input, indent + 1, out);
        }
        PlanNode::Exchange(ExchangeExec::Broadcast(x)) => {
            out.push_str(&format!("{pad}BroadcastExchange\n"));
            fmt_plan(&x.input, indent + 1, out);
        }
        PlanNode::ShuffleStageInput(x) => {
            let ranges = match (&x.partition_start_indices, &x.partition_end_indices) {
                (Some(starts), Some(ends)) => format!(
                    " ranges=[{}]",
                    starts
                        .iter()
                        .zip(ends.iter())
                        .map(|(s, e)| format!("{s}..{e}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                (Some(starts), None) => format!(" starts={starts:?}"),
                _ => String::new(),
            };
            let skewed = x
                .skewed_partitions
                .as_ref()
                .map(|s| format!(" skewed={s:?}"))
                .unwrap_or_default();
            out.push_str(&format!(
                "{pad}ShuffleStageInput stage={} local={}{ranges}{skewed}\n",
                x.stage.id(),
                x.is_local_shuffle
            ));
            fmt_plan(&x.stage.child_plan(), indent + 1, out);
        }
        PlanNode::SkewedShuffleStageInput(x) => {
            out.push_str(&format!(
                "{pad}SkewedShuffleStageInput stage={} partition={} mappers=[{}, {})\n",
                x.stage.id(),
                x.partition_id,
                x.start_map_id,
                x.end_map_id
            ));
            fmt_plan(&x.stage.child_plan(), indent + 1, out);
        }
        PlanNode::BroadcastStageInput(x) => {
            out.push_str(&format!("{pad}BroadcastStageInput stage={}\n", x.stage.id()));
            fmt_plan(&x.stage.child_plan(), indent + 1, out);
        }
    }
}

fn fmt_orders(order: &[SortOrder]) -> String {
    order
        .iter()
        .map(|o| {
            format!(
                "{}{} {}",
                o.key.name,
                o.key.id,
                if o.descending { "DESC" } else { "ASC" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_key_pairs(left: &[Attribute], right: &[Attribute]) -> String {
    left.iter()
        .zip(right.iter())
        .map(|(l, r)| format!("{}{} = {}{}", l.name, l.id, r.name, r.id))
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_partitioning(p: &Partitioning) -> String {
    match p {
        Partitioning::Unknown { partitions } => format!("unknown partitions={partitions}"),
        Partitioning::Single => "single".to_string(),
        Partitioning::HashKeys { keys, partitions } => format!(
            "hash=[{}] partitions={partitions}",
            keys.iter()
                .map(|k| format!("{}{}", k.name, k.id))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Partitioning::Broadcast => "broadcast".to_string(),
    }
}
