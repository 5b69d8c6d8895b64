use std::collections::BTreeSet;
use std::sync::Arc;

use stageflow_common::{Result, SfError};
use stageflow_shuffle::{coalesced_read, local_read, ShuffleReadPartition};

use crate::attr::{Attribute, AttributeMap};
use crate::expr::Expr;
use crate::partitioning::{Partitioning, SortOrder};
use crate::stage::QueryStage;

/// The physical operator graph.
///
/// Operators owned by the external operator library appear here only as plan
/// shapes; adaptive rewrites pattern-match over them without executing them.
#[derive(Debug, Clone)]
pub enum PlanNode {
    /// Table scan leaf.
    Scan(ScanExec),
    /// Sort.
    Sort(SortExec),
    /// Sort-merge join.
    SortMergeJoin(SortMergeJoinExec),
    /// Broadcast-hash join.
    BroadcastHashJoin(BroadcastHashJoinExec),
    /// Concatenation of child outputs.
    Union(UnionExec),
    /// Side-effecting sink command.
    Write(WriteExec),
    /// Data redistribution boundary.
    Exchange(ExchangeExec),
    /// Coalesced/local read over a completed shuffle stage.
    ShuffleStageInput(ShuffleStageInputExec),
    /// Single-reducer mapper-range read over a completed shuffle stage.
    SkewedShuffleStageInput(SkewedShuffleStageInputExec),
    /// Reference to a prepared broadcast stage.
    BroadcastStageInput(BroadcastStageInputExec),
}

/// Join flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// Inner join.
    Inner,
    /// Cross join.
    Cross,
    /// Left outer join.
    LeftOuter,
    /// Right outer join.
    RightOuter,
    /// Full outer join.
    FullOuter,
    /// Left semi join.
    LeftSemi,
    /// Left anti join.
    LeftAnti,
    /// Existence join (left rows annotated with a match flag).
    Existence,
}

/// Side chosen to build the hash table for a broadcast-hash join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSide {
    /// Build from the left input.
    Left,
    /// Build from the right input.
    Right,
}

/// Estimated statistics attached to leaf operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlanStats {
    /// Estimated output size in bytes, `None` when unknown.
    pub size_in_bytes: Option<u64>,
    /// Estimated output rows, `None` when unknown.
    pub row_count: Option<u64>,
}

/// Table scan leaf operator.
#[derive(Debug, Clone)]
pub struct ScanExec {
    /// Source table name.
    pub table: String,
    /// Output attributes.
    pub output: Vec<Attribute>,
    /// Estimated statistics from the catalog.
    pub stats: PlanStats,
    /// Number of input partitions the scan produces.
    pub partitions: usize,
}

/// Sort operator.
#[derive(Debug, Clone)]
pub struct SortExec {
    /// Sort keys, outermost first.
    pub order: Vec<SortOrder>,
    /// Whether the sort is over all partitions.
    pub global: bool,
    /// Input plan.
    pub input: Box<PlanNode>,
}

/// Sort-merge join operator.
#[derive(Debug, Clone)]
pub struct SortMergeJoinExec {
    /// Left join keys.
    pub left_keys: Vec<Attribute>,
    /// Right join keys.
    pub right_keys: Vec<Attribute>,
    /// Join flavor.
    pub join_type: JoinType,
    /// Residual non-equi condition.
    pub condition: Option<Expr>,
    /// Left input.
    pub left: Box<PlanNode>,
    /// Right input.
    pub right: Box<PlanNode>,
}

/// Broadcast-hash join operator.
#[derive(Debug, Clone)]
pub struct BroadcastHashJoinExec {
    /// Left join keys.
    pub left_keys: Vec<Attribute>,
    /// Right join keys.
    pub right_keys: Vec<Attribute>,
    /// Join flavor.
    pub join_type: JoinType,
    /// Residual non-equi condition.
    pub condition: Option<Expr>,
    /// The side replicated and hashed.
    pub build_side: BuildSide,
    /// Left input.
    pub left: Box<PlanNode>,
    /// Right input.
    pub right: Box<PlanNode>,
}

/// UNION ALL operator.
#[derive(Debug, Clone)]
pub struct UnionExec {
    /// Inputs concatenated in order.
    pub children: Vec<PlanNode>,
}

/// Side-effecting sink command.
#[derive(Debug, Clone)]
pub struct WriteExec {
    /// Target table.
    pub table: String,
    /// Input plan.
    pub input: Box<PlanNode>,
}

/// Stage-boundary exchange operators.
#[derive(Debug, Clone)]
pub enum ExchangeExec {
    /// Shuffle boundary.
    Shuffle(ShuffleExchangeExec),
    /// Broadcast boundary.
    Broadcast(BroadcastExchangeExec),
}

/// Shuffle boundary.
#[derive(Debug, Clone)]
pub struct ShuffleExchangeExec {
    /// Target partitioning; must be hash or single.
    pub partitioning: Partitioning,
    /// Input plan.
    pub input: Box<PlanNode>,
}

/// Broadcast boundary.
#[derive(Debug, Clone)]
pub struct BroadcastExchangeExec {
    /// Input plan.
    pub input: Box<PlanNode>,
}

/// Coalesced or local read over a completed shuffle stage.
#[derive(Debug, Clone)]
pub struct ShuffleStageInputExec {
    /// The hidden shuffle stage.
    pub stage: Arc<QueryStage>,
    /// Output attributes; ids may differ from the stage's own output.
    pub output: Vec<Attribute>,
    /// Read one post-shuffle partition per mapper instead of per reducer
    /// range; set after a broadcast demotion removes the shuffle dependency.
    pub is_local_shuffle: bool,
    /// Reducer ids routed to skew sub-joins instead of coalesced groups.
    pub skewed_partitions: Option<BTreeSet<u32>>,
    /// Coalesced group start indices, assigned once before parent execution.
    pub partition_start_indices: Option<Vec<u32>>,
    /// Coalesced group end indices; defaults to the next start when unset.
    pub partition_end_indices: Option<Vec<u32>>,
}

impl ShuffleStageInputExec {
    /// Plain full read of a stage under the given output attributes.
    pub fn new(stage: Arc<QueryStage>, output: Vec<Attribute>) -> Self {
        Self {
            stage,
            output,
            is_local_shuffle: false,
            skewed_partitions: None,
            partition_start_indices: None,
            partition_end_indices: None,
        }
    }

    /// Renaming map from the stage's own output to this input's output.
    pub fn attribute_map(&self) -> AttributeMap {
        AttributeMap::between(&self.stage.child_plan().output(), &self.output)
    }

    /// Post-shuffle read assignments for this input.
    ///
    /// Requires the child stage's statistics to be materialized.
    pub fn read_partitions(&self) -> Result<Vec<ShuffleReadPartition>> {
        let stats = self.stage.statistics().ok_or_else(|| {
            SfError::PlanInvariant(format!(
                "stage {} statistics not materialized before read planning",
                self.stage.id()
            ))
        })?;
        let p = stats.num_partitions() as u32;
        let m = stats.num_mappers;
        if self.is_local_shuffle {
            return Ok(local_read(p, m));
        }
        Ok(coalesced_read(
            self.partition_start_indices.as_deref(),
            self.partition_end_indices.as_deref(),
            p,
            m,
        ))
    }
}

/// Single-reducer mapper-range read produced by the skew rewriter.
#[derive(Debug, Clone)]
pub struct SkewedShuffleStageInputExec {
    /// The hidden shuffle stage.
    pub stage: Arc<QueryStage>,
    /// Output attributes; ids may differ from the stage's own output.
    pub output: Vec<Attribute>,
    /// The single reducer id this input reads.
    pub partition_id: u32,
    /// First mapper id (inclusive).
    pub start_map_id: u32,
    /// Last mapper id (exclusive).
    pub end_map_id: u32,
}

impl SkewedShuffleStageInputExec {
    /// The one read assignment this input describes.
    pub fn read_partition(&self) -> ShuffleReadPartition {
        ShuffleReadPartition {
            reducer_start: self.partition_id,
            reducer_end: self.partition_id + 1,
            map_start: self.start_map_id,
            map_end: self.end_map_id,
        }
    }
}

/// Reference to a prepared broadcast stage.
#[derive(Debug, Clone)]
pub struct BroadcastStageInputExec {
    /// The hidden broadcast stage.
    pub stage: Arc<QueryStage>,
    /// Output attributes; ids may differ from the stage's own output.
    pub output: Vec<Attribute>,
}

impl PlanNode {
    /// Direct child operators. Stage inputs are leaves: the stage behind
    /// them belongs to an earlier planning pass, not to this tree.
    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::Scan(_)
            | PlanNode::ShuffleStageInput(_)
            | PlanNode::SkewedShuffleStageInput(_)
            | PlanNode::BroadcastStageInput(_) => vec![],
            PlanNode::Sort(x) => vec![x.input.as_ref()],
            PlanNode::SortMergeJoin(x) => vec![x.left.as_ref(), x.right.as_ref()],
            PlanNode::BroadcastHashJoin(x) => vec![x.left.as_ref(), x.right.as_ref()],
            PlanNode::Union(x) => x.children.iter().collect(),
            PlanNode::Write(x) => vec![x.input.as_ref()],
            PlanNode::Exchange(ExchangeExec::Shuffle(x)) => vec![x.input.as_ref()],
            PlanNode::Exchange(ExchangeExec::Broadcast(x)) => vec![x.input.as_ref()],
        }
    }

    /// Output attributes of this operator.
    pub fn output(&self) -> Vec<Attribute> {
        match self {
            PlanNode::Scan(x) => x.output.clone(),
            PlanNode::Sort(x) => x.input.output(),
            PlanNode::SortMergeJoin(x) => {
                join_output(x.join_type, x.left.as_ref(), x.right.as_ref())
            }
            PlanNode::BroadcastHashJoin(x) => {
                join_output(x.join_type, x.left.as_ref(), x.right.as_ref())
            }
            PlanNode::Union(x) => x
                .children
                .first()
                .map(PlanNode::output)
                .unwrap_or_default(),
            PlanNode::Write(x) => x.input.output(),
            PlanNode::Exchange(ExchangeExec::Shuffle(x)) => x.input.output(),
            PlanNode::Exchange(ExchangeExec::Broadcast(x)) => x.input.output(),
            PlanNode::ShuffleStageInput(x) => x.output.clone(),
            PlanNode::SkewedShuffleStageInput(x) => x.output.clone(),
            PlanNode::BroadcastStageInput(x) => x.output.clone(),
        }
    }

    /// Output row layout of this operator.
    pub fn output_partitioning(&self) -> Partitioning {
        match self {
            PlanNode::Scan(x) => Partitioning::Unknown {
                partitions: x.partitions,
            },
            PlanNode::Sort(x) => x.input.output_partitioning(),
            PlanNode::SortMergeJoin(x) => x.left.output_partitioning(),
            PlanNode::BroadcastHashJoin(x) => match x.build_side {
                BuildSide::Right => x.left.output_partitioning(),
                BuildSide::Left => x.right.output_partitioning(),
            },
            PlanNode::Union(x) => Partitioning::Unknown {
                partitions: x
                    .children
                    .iter()
                    .map(|c| c.output_partitioning().num_partitions())
                    .sum(),
            },
            PlanNode::Write(x) => x.input.output_partitioning(),
            PlanNode::Exchange(ExchangeExec::Shuffle(x)) => x.partitioning.clone(),
            PlanNode::Exchange(ExchangeExec::Broadcast(_)) => Partitioning::Broadcast,
            PlanNode::ShuffleStageInput(x) => shuffle_input_partitioning(x),
            PlanNode::SkewedShuffleStageInput(x) => {
                let map = AttributeMap::between(&x.stage.child_plan().output(), &x.output);
                match stage_exchange_partitioning(&x.stage) {
                    Some(Partitioning::HashKeys { keys, .. }) => Partitioning::HashKeys {
                        keys: map.map_all(&keys),
                        partitions: 1,
                    },
                    _ => Partitioning::Unknown { partitions: 1 },
                }
            }
            PlanNode::BroadcastStageInput(_) => Partitioning::Broadcast,
        }
    }

    /// Output ordering of this operator.
    pub fn output_ordering(&self) -> Vec<SortOrder> {
        match self {
            PlanNode::Sort(x) => x.order.clone(),
            PlanNode::SortMergeJoin(x) => x.left.output_ordering(),
            PlanNode::BroadcastHashJoin(x) => match x.build_side {
                BuildSide::Right => x.left.output_ordering(),
                BuildSide::Left => x.right.output_ordering(),
            },
            PlanNode::Write(x) => x.input.output_ordering(),
            _ => vec![],
        }
    }

    /// Estimated output size, from materialized stage statistics where
    /// available and catalog estimates at the leaves. `None` means unknown.
    pub fn estimated_size_in_bytes(&self) -> Option<u64> {
        match self {
            PlanNode::Scan(x) => x.stats.size_in_bytes,
            PlanNode::Sort(x) => x.input.estimated_size_in_bytes(),
            PlanNode::SortMergeJoin(x) => sum_sizes(&[x.left.as_ref(), x.right.as_ref()]),
            PlanNode::BroadcastHashJoin(x) => sum_sizes(&[x.left.as_ref(), x.right.as_ref()]),
            PlanNode::Union(x) => sum_sizes(&x.children.iter().collect::<Vec<_>>()),
            PlanNode::Write(x) => x.input.estimated_size_in_bytes(),
            PlanNode::Exchange(ExchangeExec::Shuffle(x)) => x.input.estimated_size_in_bytes(),
            PlanNode::Exchange(ExchangeExec::Broadcast(x)) => x.input.estimated_size_in_bytes(),
            PlanNode::ShuffleStageInput(x) => x.stage.statistics().map(|s| s.total_bytes()),
            PlanNode::SkewedShuffleStageInput(x) => x
                .stage
                .statistics()
                .and_then(|s| s.bytes_by_partition.get(x.partition_id as usize).copied()),
            PlanNode::BroadcastStageInput(_) => None,
        }
    }

    /// Rebuild this node with each child transformed by `f`, in order.
    pub fn map_children(self, f: &mut impl FnMut(PlanNode) -> PlanNode) -> PlanNode {
        match self {
            PlanNode::Sort(mut x) => {
                x.input = Box::new(f(*x.input));
                PlanNode::Sort(x)
            }
            PlanNode::SortMergeJoin(mut x) => {
                x.left = Box::new(f(*x.left));
                x.right = Box::new(f(*x.right));
                PlanNode::SortMergeJoin(x)
            }
            PlanNode::BroadcastHashJoin(mut x) => {
                x.left = Box::new(f(*x.left));
                x.right = Box::new(f(*x.right));
                PlanNode::BroadcastHashJoin(x)
            }
            PlanNode::Union(mut x) => {
                x.children = x.children.into_iter().map(f).collect();
                PlanNode::Union(x)
            }
            PlanNode::Write(mut x) => {
                x.input = Box::new(f(*x.input));
                PlanNode::Write(x)
            }
            PlanNode::Exchange(ExchangeExec::Shuffle(mut x)) => {
                x.input = Box::new(f(*x.input));
                PlanNode::Exchange(ExchangeExec::Shuffle(x))
            }
            PlanNode::Exchange(ExchangeExec::Broadcast(mut x)) => {
                x.input = Box::new(f(*x.input));
                PlanNode::Exchange(ExchangeExec::Broadcast(x))
            }
            leaf => leaf,
        }
    }

    /// Rebuild this node with the child at `idx` replaced.
    ///
    /// Indexing past the child list is a programming error.
    pub fn replace_child(self, idx: usize, new_child: PlanNode) -> PlanNode {
        let arity = self.children().len();
        assert!(idx < arity, "child index {idx} out of range for arity {arity}");
        let mut i = 0;
        let mut slot = Some(new_child);
        self.map_children(&mut |child| {
            let out = if i == idx {
                slot.take().expect("replacement consumed once")
            } else {
                child
            };
            i += 1;
            out
        })
    }

    /// All shuffle stage inputs in this tree, in visit order.
    pub fn shuffle_stage_inputs(&self) -> Vec<&ShuffleStageInputExec> {
        let mut out = Vec::new();
        collect_shuffle_inputs(self, &mut out);
        out
    }

    /// All broadcast stage inputs in this tree, in visit order.
    pub fn broadcast_stage_inputs(&self) -> Vec<&BroadcastStageInputExec> {
        let mut out = Vec::new();
        collect_broadcast_inputs(self, &mut out);
        out
    }
}

fn join_output(join_type: JoinType, left: &PlanNode, right: &PlanNode) -> Vec<Attribute> {
    match join_type {
        JoinType::LeftSemi | JoinType::LeftAnti | JoinType::Existence => left.output(),
        _ => {
            let mut out = left.output();
            out.extend(right.output());
            out
        }
    }
}

fn sum_sizes(nodes: &[&PlanNode]) -> Option<u64> {
    let mut total = 0_u64;
    for n in nodes {
        total = total.checked_add(n.estimated_size_in_bytes()?)?;
    }
    Some(total)
}

fn stage_exchange_partitioning(stage: &QueryStage) -> Option<Partitioning> {
    match stage.child_plan() {
        PlanNode::Exchange(ExchangeExec::Shuffle(e)) => Some(e.partitioning),
        _ => None,
    }
}

fn shuffle_input_partitioning(input: &ShuffleStageInputExec) -> Partitioning {
    if input.is_local_shuffle {
        let mappers = input
            .stage
            .statistics()
            .map(|s| s.num_mappers as usize)
            .unwrap_or(0);
        return Partitioning::Unknown {
            partitions: mappers,
        };
    }
    let map = AttributeMap::between(&input.stage.child_plan().output(), &input.output);
    match stage_exchange_partitioning(&input.stage) {
        Some(Partitioning::HashKeys { keys, partitions }) => {
            let partitions = input
                .partition_start_indices
                .as_ref()
                .map(|s| s.len())
                .unwrap_or(partitions);
            Partitioning::HashKeys {
                keys: map.map_all(&keys),
                partitions,
            }
        }
        Some(other) => other,
        None => Partitioning::Unknown { partitions: 0 },
    }
}

fn collect_shuffle_inputs<'a>(plan: &'a PlanNode, out: &mut Vec<&'a ShuffleStageInputExec>) {
    if let PlanNode::ShuffleStageInput(x) = plan {
        out.push(x);
    }
    for child in plan.children() {
        collect_shuffle_inputs(child, out);
    }
}

fn collect_broadcast_inputs<'a>(plan: &'a PlanNode, out: &mut Vec<&'a BroadcastStageInputExec>) {
    if let PlanNode::BroadcastStageInput(x) = plan {
        out.push(x);
    }
    for child in plan.children() {
        collect_broadcast_inputs(child, out);
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use stageflow_common::StageId;
    use stageflow_shuffle::MapOutputStatistics;

    use super::*;
    use crate::attr::Attribute;

    fn staged_exchange(bytes: Vec<u64>, num_mappers: u32) -> (Arc<QueryStage>, Vec<Attribute>) {
        let key = Attribute::new("k", DataType::Int64);
        let output = vec![key.clone(), Attribute::new("v", DataType::Int64)];
        let partitions = bytes.len();
        let exchange = PlanNode::Exchange(ExchangeExec::Shuffle(ShuffleExchangeExec {
            partitioning: Partitioning::HashKeys {
                keys: vec![key],
                partitions,
            },
            input: Box::new(PlanNode::Scan(ScanExec {
                table: "t".to_string(),
                output: output.clone(),
                stats: PlanStats::default(),
                partitions: num_mappers as usize,
            })),
        }));
        let stage = QueryStage::shuffle(StageId(7), exchange);
        let rows = vec![1_u64; bytes.len()];
        stage
            .set_statistics(MapOutputStatistics::new(bytes, rows, num_mappers).expect("stats"))
            .expect("first assignment");
        (stage, output)
    }

    #[test]
    fn unassigned_input_reads_one_partition_per_reducer() {
        let (stage, output) = staged_exchange(vec![10, 20, 30], 2);
        let input = ShuffleStageInputExec::new(stage, output);
        let parts = input.read_partitions().expect("parts");
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.map_start == 0 && p.map_end == 2));
    }

    #[test]
    fn coalesced_input_follows_assigned_starts() {
        let (stage, output) = staged_exchange(vec![10, 20, 30, 40], 2);
        let mut input = ShuffleStageInputExec::new(stage, output);
        input.partition_start_indices = Some(vec![0, 3]);
        let parts = input.read_partitions().expect("parts");
        assert_eq!(parts.len(), 2);
        assert_eq!((parts[0].reducer_start, parts[0].reducer_end), (0, 3));
        assert_eq!((parts[1].reducer_start, parts[1].reducer_end), (3, 4));
    }

    #[test]
    fn local_input_reads_one_partition_per_mapper() {
        let (stage, output) = staged_exchange(vec![10, 20], 3);
        let mut input = ShuffleStageInputExec::new(stage, output);
        input.is_local_shuffle = true;
        let parts = input.read_partitions().expect("parts");
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.reducer_start == 0 && p.reducer_end == 2));
    }

    #[test]
    fn skewed_input_describes_single_reducer_mapper_range() {
        let (stage, output) = staged_exchange(vec![10, 20], 8);
        let input = SkewedShuffleStageInputExec {
            stage,
            output,
            partition_id: 1,
            start_map_id: 2,
            end_map_id: 5,
        };
        let part = input.read_partition();
        assert_eq!((part.reducer_start, part.reducer_end), (1, 2));
        assert_eq!((part.map_start, part.map_end), (2, 5));
    }

    #[test]
    fn stage_input_size_comes_from_materialized_statistics() {
        let (stage, output) = staged_exchange(vec![10, 20, 30], 2);
        let input = PlanNode::ShuffleStageInput(ShuffleStageInputExec::new(stage, output));
        assert_eq!(input.estimated_size_in_bytes(), Some(60));
    }

    #[test]
    fn stage_input_partitioning_is_remapped_to_its_own_output() {
        let (stage, stage_output) = staged_exchange(vec![10, 20, 30], 2);
        let renamed = stage_output
            .iter()
            .map(Attribute::with_new_id)
            .collect::<Vec<_>>();
        let input =
            PlanNode::ShuffleStageInput(ShuffleStageInputExec::new(stage, renamed.clone()));
        let Partitioning::HashKeys { keys, partitions } = input.output_partitioning() else {
            panic!("expected hash partitioning");
        };
        assert_eq!(partitions, 3);
        assert_eq!(keys[0].id, renamed[0].id);
    }
}
