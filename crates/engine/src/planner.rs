//! Stage insertion over a physical plan.
//!
//! Contract:
//! - bottom-up, one pass; every exchange becomes a stage input hiding a
//!   fresh query stage;
//! - an exchange semantically equal (modulo attribute renaming) to one
//!   already planned reuses that stage under a new input;
//! - side-effecting command roots stay unwrapped; everything else roots in a
//!   result stage.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_schema::DataType;
use stageflow_common::metrics::global_metrics;
use stageflow_common::{AdaptiveConfig, StageId};
use stageflow_plan::{
    same_result, BroadcastStageInputExec, ExchangeExec, PlanNode, QueryStage,
    ShuffleStageInputExec,
};
use tracing::debug;

/// Output of the stage planner.
#[derive(Debug, Clone)]
pub enum PlannedQuery {
    /// The terminal result stage of an adaptively planned query.
    Stage(Arc<QueryStage>),
    /// The plan untouched: adaptive execution is off, or the root is a
    /// side-effecting command.
    Unchanged(PlanNode),
}

type SchemaKey = Vec<(String, DataType)>;

/// One-shot transform wrapping exchanges into query stages.
#[derive(Debug)]
pub struct QueryStagePlanner {
    enabled: bool,
    next_stage_id: u64,
    planned: HashMap<SchemaKey, Vec<Arc<QueryStage>>>,
}

impl QueryStagePlanner {
    /// Planner gated by the adaptive-execution flag.
    pub fn new(config: &AdaptiveConfig) -> Self {
        Self {
            enabled: config.adaptive_execution_enabled,
            next_stage_id: 0,
            planned: HashMap::new(),
        }
    }

    /// Fragment `plan` at exchange boundaries.
    pub fn plan(&mut self, plan: PlanNode) -> PlannedQuery {
        if !self.enabled {
            return PlannedQuery::Unchanged(plan);
        }
        let transformed = self.insert_stages(plan);
        if matches!(transformed, PlanNode::Write(_)) {
            return PlannedQuery::Unchanged(transformed);
        }
        let stage = QueryStage::result(self.next_id(), transformed);
        PlannedQuery::Stage(stage)
    }

    fn next_id(&mut self) -> StageId {
        let id = StageId(self.next_stage_id);
        self.next_stage_id += 1;
        id
    }

    fn insert_stages(&mut self, plan: PlanNode) -> PlanNode {
        match plan {
            PlanNode::Exchange(ExchangeExec::Shuffle(mut x)) => {
                x.input = Box::new(self.insert_stages(*x.input));
                let exchange = PlanNode::Exchange(ExchangeExec::Shuffle(x));
                let output = exchange.output();
                if let Some(existing) = self.find_reusable(&exchange) {
                    global_metrics().inc_stage_reuse("shuffle");
                    debug!(stage = %existing.id(), "reusing planned shuffle stage");
                    return PlanNode::ShuffleStageInput(ShuffleStageInputExec::new(
                        existing, output,
                    ));
                }
                let stage = QueryStage::shuffle(self.next_id(), exchange);
                self.remember(&output, &stage);
                PlanNode::ShuffleStageInput(ShuffleStageInputExec::new(stage, output))
            }
            PlanNode::Exchange(ExchangeExec::Broadcast(mut x)) => {
                x.input = Box::new(self.insert_stages(*x.input));
                let exchange = PlanNode::Exchange(ExchangeExec::Broadcast(x));
                let output = exchange.output();
                if let Some(existing) = self.find_reusable(&exchange) {
                    global_metrics().inc_stage_reuse("broadcast");
                    debug!(stage = %existing.id(), "reusing planned broadcast stage");
                    return PlanNode::BroadcastStageInput(BroadcastStageInputExec {
                        stage: existing,
                        output,
                    });
                }
                let stage = QueryStage::broadcast(self.next_id(), exchange);
                self.remember(&output, &stage);
                PlanNode::BroadcastStageInput(BroadcastStageInputExec { stage, output })
            }
            PlanNode::Sort(mut x) => {
                x.input = Box::new(self.insert_stages(*x.input));
                PlanNode::Sort(x)
            }
            PlanNode::SortMergeJoin(mut x) => {
                x.left = Box::new(self.insert_stages(*x.left));
                x.right = Box::new(self.insert_stages(*x.right));
                PlanNode::SortMergeJoin(x)
            }
            PlanNode::BroadcastHashJoin(mut x) => {
                x.left = Box::new(self.insert_stages(*x.left));
                x.right = Box::new(self.insert_stages(*x.right));
                PlanNode::BroadcastHashJoin(x)
            }
            PlanNode::Union(mut x) => {
                x.children = x
                    .children
                    .into_iter()
                    .map(|c| self.insert_stages(c))
                    .collect();
                PlanNode::Union(x)
            }
            PlanNode::Write(mut x) => {
                x.input = Box::new(self.insert_stages(*x.input));
                PlanNode::Write(x)
            }
            leaf => leaf,
        }
    }

    fn find_reusable(&self, exchange: &PlanNode) -> Option<Arc<QueryStage>> {
        let key = schema_key(exchange);
        self.planned
            .get(&key)?
            .iter()
            .find(|stage| same_result(&stage.child_plan(), exchange))
            .cloned()
    }

    fn remember(&mut self, output: &[stageflow_plan::Attribute], stage: &Arc<QueryStage>) {
        let key: SchemaKey = output
            .iter()
            .map(|a| (a.name.clone(), a.data_type.clone()))
            .collect();
        self.planned.entry(key).or_default().push(stage.clone());
    }
}

fn schema_key(plan: &PlanNode) -> SchemaKey {
    plan.output()
        .iter()
        .map(|a| (a.name.clone(), a.data_type.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use stageflow_plan::{
        Attribute, Partitioning, PlanStats, ScanExec, ShuffleExchangeExec, SortMergeJoinExec,
        UnionExec, WriteExec,
    };

    use super::*;
    use stageflow_plan::JoinType;

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

    fn shuffle(input: PlanNode) -> PlanNode {
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
    fn wraps_root_in_result_stage() {
        let mut planner = QueryStagePlanner::new(&AdaptiveConfig::default());
        let PlannedQuery::Stage(stage) = planner.plan(shuffle(scan("t"))) else {
            panic!("expected result stage");
        };
        assert_eq!(stage.kind(), stageflow_plan::StageKind::Result);
        let child = stage.child_plan();
        assert_eq!(child.shuffle_stage_inputs().len(), 1);
    }

    #[test]
    fn identical_exchanges_share_one_stage() {
        let mut planner = QueryStagePlanner::new(&AdaptiveConfig::default());
        let union = PlanNode::Union(UnionExec {
            children: vec![shuffle(scan("t")), shuffle(scan("t"))],
        });
        let PlannedQuery::Stage(stage) = planner.plan(union) else {
            panic!("expected result stage");
        };
        let child = stage.child_plan();
        let inputs = child.shuffle_stage_inputs();
        assert_eq!(inputs.len(), 2);
        assert!(Arc::ptr_eq(&inputs[0].stage, &inputs[1].stage));
    }

    #[test]
    fn different_exchanges_get_distinct_stages() {
        let mut planner = QueryStagePlanner::new(&AdaptiveConfig::default());
        let left = shuffle(scan("a"));
        let right = shuffle(scan("b"));
        let lk = left.output()[0].clone();
        let rk = right.output()[0].clone();
        let join = PlanNode::SortMergeJoin(SortMergeJoinExec {
            left_keys: vec![lk],
            right_keys: vec![rk],
            join_type: JoinType::Inner,
            condition: None,
            left: Box::new(left),
            right: Box::new(right),
        });
        let PlannedQuery::Stage(stage) = planner.plan(join) else {
            panic!("expected result stage");
        };
        let child = stage.child_plan();
        let inputs = child.shuffle_stage_inputs();
        assert_eq!(inputs.len(), 2);
        assert!(!Arc::ptr_eq(&inputs[0].stage, &inputs[1].stage));
    }

    #[test]
    fn command_roots_stay_unwrapped() {
        let mut planner = QueryStagePlanner::new(&AdaptiveConfig::default());
        let write = PlanNode::Write(WriteExec {
            table: "out".to_string(),
            input: Box::new(shuffle(scan("t"))),
        });
        let PlannedQuery::Unchanged(plan) = planner.plan(write) else {
            panic!("expected unchanged command root");
        };
        // The subtree is still staged, only the root stays a command.
        assert_eq!(plan.shuffle_stage_inputs().len(), 1);
    }

    #[test]
    fn disabled_planner_is_identity() {
        let mut planner = QueryStagePlanner::new(&AdaptiveConfig {
            adaptive_execution_enabled: false,
            ..AdaptiveConfig::default()
        });
        let PlannedQuery::Unchanged(plan) = planner.plan(shuffle(scan("t"))) else {
            panic!("expected unchanged plan");
        };
        assert!(matches!(plan, PlanNode::Exchange(_)));
    }
}
