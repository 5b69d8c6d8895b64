//! Query stages: plan-tree wrappers around exchange boundaries.
//!
//! Contract:
//! - a stage's child plan is swapped atomically and never mutated in place;
//! - map-output statistics and the cached execution artifact are
//!   single-assignment slots;
//! - the artifact mutex is the stage monitor: holding it serializes
//!   concurrent executions of the same stage.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use stageflow_common::{Result, SfError, StageId};
use stageflow_shuffle::{BroadcastPayload, MapOutputStatistics, RowSet, ShuffledRowSet};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::node::PlanNode;

/// Stage flavor, determined by the exchange at the stage's root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Child is a shuffle exchange producing map outputs.
    Shuffle,
    /// Child is a broadcast exchange producing a replicated value.
    Broadcast,
    /// Terminal stage returning the query result.
    Result,
}

impl StageKind {
    /// Lowercase label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            StageKind::Shuffle => "shuffle",
            StageKind::Broadcast => "broadcast",
            StageKind::Result => "result",
        }
    }
}

/// Memoized result of one executed stage.
#[derive(Debug, Clone)]
pub enum StageArtifact {
    /// Shuffle handle produced by a shuffle stage.
    Shuffled(ShuffledRowSet),
    /// Materialized rows produced by a result stage.
    Rows(RowSet),
    /// Replicated value produced by a broadcast stage.
    Broadcast(BroadcastPayload),
}

/// A unit of the physical plan bounded by exchanges.
///
/// Shared as `Arc<QueryStage>`; stage-input leaves in downstream plans hold
/// the same handle, which is how common sub-plans collapse onto one stage.
#[derive(Debug)]
pub struct QueryStage {
    id: StageId,
    kind: StageKind,
    child: StdMutex<PlanNode>,
    stats: OnceLock<MapOutputStatistics>,
    artifact: AsyncMutex<Option<StageArtifact>>,
}

impl QueryStage {
    fn new(id: StageId, kind: StageKind, child: PlanNode) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            child: StdMutex::new(child),
            stats: OnceLock::new(),
            artifact: AsyncMutex::new(None),
        })
    }

    /// Create a shuffle stage over a shuffle-exchange child.
    pub fn shuffle(id: StageId, child: PlanNode) -> Arc<Self> {
        Self::new(id, StageKind::Shuffle, child)
    }

    /// Create a broadcast stage over a broadcast-exchange child.
    pub fn broadcast(id: StageId, child: PlanNode) -> Arc<Self> {
        Self::new(id, StageKind::Broadcast, child)
    }

    /// Create the terminal result stage.
    pub fn result(id: StageId, child: PlanNode) -> Arc<Self> {
        Self::new(id, StageKind::Result, child)
    }

    /// Stage identifier.
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Stage flavor.
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Snapshot of the current child plan.
    pub fn child_plan(&self) -> PlanNode {
        self.child.lock().expect("stage child lock poisoned").clone()
    }

    /// Atomically replace the child plan with a rewritten value.
    pub fn set_child(&self, plan: PlanNode) {
        *self.child.lock().expect("stage child lock poisoned") = plan;
    }

    /// Map-output statistics, present once the stage's shuffle completed.
    pub fn statistics(&self) -> Option<&MapOutputStatistics> {
        self.stats.get()
    }

    /// Record map-output statistics; assigning twice is a plan invariant
    /// violation.
    pub fn set_statistics(&self, stats: MapOutputStatistics) -> Result<()> {
        self.stats.set(stats).map_err(|_| {
            SfError::PlanInvariant(format!(
                "map-output statistics assigned twice for stage {}",
                self.id
            ))
        })
    }

    /// Acquire the stage monitor guarding execution and the memo slot.
    pub async fn lock_artifact(&self) -> MutexGuard<'_, Option<StageArtifact>> {
        self.artifact.lock().await
    }

    /// Cached artifact, if the stage already executed.
    pub async fn cached_artifact(&self) -> Option<StageArtifact> {
        self.artifact.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use stageflow_common::StageId;

    use super::*;
    use crate::attr::Attribute;
    use crate::node::{PlanStats, ScanExec};

    fn scan() -> PlanNode {
        PlanNode::Scan(ScanExec {
            table: "t".to_string(),
            output: vec![Attribute::new("k", DataType::Int64)],
            stats: PlanStats::default(),
            partitions: 1,
        })
    }

    #[test]
    fn statistics_slot_is_single_assignment() {
        let stage = QueryStage::shuffle(StageId(1), scan());
        let stats = MapOutputStatistics::new(vec![1, 2], vec![1, 1], 1).expect("stats");
        assert!(stage.statistics().is_none());
        stage.set_statistics(stats.clone()).expect("first");
        let err = stage.set_statistics(stats).expect_err("second assignment");
        assert!(matches!(err, SfError::PlanInvariant(_)));
        assert_eq!(stage.statistics().expect("set").num_mappers, 1);
    }

    #[test]
    fn child_plan_swaps_atomically() {
        let stage = QueryStage::result(StageId(2), scan());
        let before = stage.child_plan();
        assert!(matches!(before, PlanNode::Scan(_)));
        stage.set_child(PlanNode::Union(crate::node::UnionExec {
            children: vec![before],
        }));
        assert!(matches!(stage.child_plan(), PlanNode::Union(_)));
    }

    #[tokio::test]
    async fn artifact_slot_memoizes() {
        let stage = QueryStage::result(StageId(3), scan());
        assert!(stage.cached_artifact().await.is_none());
        {
            let mut slot = stage.lock_artifact().await;
            *slot = Some(StageArtifact::Rows(RowSet::default()));
        }
        assert!(matches!(
            stage.cached_artifact().await,
            Some(StageArtifact::Rows(_))
        ));
    }
}
