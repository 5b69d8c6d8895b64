//! Execution environment consumed by the stage runtime.
//!
//! The trait is the seam to the host engine: shuffle writes, broadcast
//! materialization, result-stage execution, and the codegen collapse hook.
//! [`LocalExecutionEnv`] is the in-process implementation backed by the
//! map-output store; operators owned by the external operator library are
//! out of its scope and report as unsupported.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use arrow::record_batch::RecordBatch;
use stageflow_common::{Result, SfError, ShuffleId, StageId};
use stageflow_plan::{ExchangeExec, Partitioning, PlanNode, ScanExec, ShuffleExchangeExec};
use stageflow_shuffle::{
    encode_ipc_bytes, partition_batches, BroadcastPayload, MapOutputStatistics,
    MapPartitionPayload, RowSet, ShuffleStore, ShuffledRowSet,
};
use tracing::debug;

/// Host-engine surface the stage runtime drives.
pub trait ExecutionEnv: Send + Sync {
    /// Run a shuffle exchange end-to-end: materialize its input, write map
    /// outputs, and return the shuffled rows plus their statistics.
    fn eager_execute_shuffle(
        &self,
        stage: StageId,
        exchange: &ShuffleExchangeExec,
    ) -> Result<(ShuffledRowSet, MapOutputStatistics)>;

    /// Materialize a plan and replicate it.
    fn broadcast(&self, stage: StageId, plan: &PlanNode) -> Result<BroadcastPayload>;

    /// Materialize the finalized child plan of a result stage.
    fn execute_plan(&self, plan: &PlanNode) -> Result<RowSet>;

    /// Whole-stage fusion hook; identity unless the host provides one.
    fn collapse_codegen(&self, plan: PlanNode) -> PlanNode {
        plan
    }
}

/// In-process environment over registered tables and the map-output store.
///
/// Each record batch registered for a table acts as one input partition, so
/// a scan feeding a shuffle produces one map task per batch.
#[derive(Debug)]
pub struct LocalExecutionEnv {
    store: Arc<ShuffleStore>,
    tables: RwLock<HashMap<String, Vec<RecordBatch>>>,
    shuffles: RwLock<HashMap<StageId, ShuffleId>>,
    broadcasts: RwLock<HashMap<StageId, BroadcastPayload>>,
    host: String,
}

impl LocalExecutionEnv {
    /// Environment with a fresh store, reporting `localhost` as map location.
    pub fn new() -> Self {
        Self::with_host("localhost")
    }

    /// Environment reporting `host` as the location of every map output.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            store: Arc::new(ShuffleStore::new()),
            tables: RwLock::new(HashMap::new()),
            shuffles: RwLock::new(HashMap::new()),
            broadcasts: RwLock::new(HashMap::new()),
            host: host.into(),
        }
    }

    /// The map-output store backing this environment.
    pub fn store(&self) -> Arc<ShuffleStore> {
        self.store.clone()
    }

    /// Register scan input; each batch is one input partition.
    pub fn register_table(&self, name: impl Into<String>, partitions: Vec<RecordBatch>) {
        self.tables
            .write()
            .expect("table registry lock poisoned")
            .insert(name.into(), partitions);
    }

    /// Shuffle registered for a completed stage, if any.
    pub fn shuffle_for_stage(&self, stage: StageId) -> Option<ShuffleId> {
        self.shuffles
            .read()
            .expect("shuffle registry lock poisoned")
            .get(&stage)
            .copied()
    }

    fn scan_partitions(&self, scan: &ScanExec) -> Result<Vec<Vec<RecordBatch>>> {
        let tables = self.tables.read().expect("table registry lock poisoned");
        let batches = tables.get(&scan.table).ok_or_else(|| {
            SfError::InvalidConfig(format!("table '{}' is not registered", scan.table))
        })?;
        Ok(batches.iter().cloned().map(|b| vec![b]).collect())
    }

    // One outer vector entry per input partition (= map task downstream).
    fn materialize_partitions(&self, plan: &PlanNode) -> Result<Vec<Vec<RecordBatch>>> {
        match plan {
            PlanNode::Scan(scan) => self.scan_partitions(scan),
            PlanNode::Union(union) => {
                let mut out = Vec::new();
                for child in &union.children {
                    out.extend(self.materialize_partitions(child)?);
                }
                Ok(out)
            }
            PlanNode::ShuffleStageInput(input) => {
                let shuffle = self
                    .shuffle_for_stage(input.stage.id())
                    .ok_or_else(|| {
                        SfError::Execution(format!(
                            "stage {} has no registered shuffle output",
                            input.stage.id()
                        ))
                    })?;
                input
                    .read_partitions()?
                    .iter()
                    .map(|part| self.store.read(shuffle, part))
                    .collect()
            }
            PlanNode::SkewedShuffleStageInput(input) => {
                let shuffle = self
                    .shuffle_for_stage(input.stage.id())
                    .ok_or_else(|| {
                        SfError::Execution(format!(
                            "stage {} has no registered shuffle output",
                            input.stage.id()
                        ))
                    })?;
                Ok(vec![self.store.read(shuffle, &input.read_partition())?])
            }
            PlanNode::BroadcastStageInput(input) => {
                let broadcasts = self
                    .broadcasts
                    .read()
                    .expect("broadcast registry lock poisoned");
                let payload = broadcasts.get(&input.stage.id()).ok_or_else(|| {
                    SfError::Execution(format!(
                        "stage {} has no prepared broadcast value",
                        input.stage.id()
                    ))
                })?;
                Ok(vec![payload.batches.clone()])
            }
            other => Err(SfError::Unsupported(format!(
                "operator {} is executed by the host engine, not the local environment",
                operator_name(other)
            ))),
        }
    }
}

impl Default for LocalExecutionEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEnv for LocalExecutionEnv {
    fn eager_execute_shuffle(
        &self,
        stage: StageId,
        exchange: &ShuffleExchangeExec,
    ) -> Result<(ShuffledRowSet, MapOutputStatistics)> {
        let input_partitions = self.materialize_partitions(&exchange.input)?;
        let (num_reducers, key_indexes) = match &exchange.partitioning {
            Partitioning::HashKeys { keys, partitions } => {
                let output = exchange.input.output();
                let indexes = keys
                    .iter()
                    .map(|k| {
                        output.iter().position(|a| a.id == k.id).ok_or_else(|| {
                            SfError::PlanInvariant(format!(
                                "shuffle key {}{} missing from exchange input",
                                k.name, k.id
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                (*partitions as u32, indexes)
            }
            Partitioning::Single => (1, Vec::new()),
            other => {
                return Err(SfError::InvalidConfig(format!(
                    "shuffle exchange cannot target {other:?} partitioning"
                )))
            }
        };

        let num_reducers = num_reducers.max(1);
        let shuffle = self.store.create_shuffle(num_reducers)?;
        for map_batches in &input_partitions {
            let payloads = match &exchange.partitioning {
                Partitioning::Single => vec![single_payload(map_batches)?],
                _ => partition_batches(map_batches, &key_indexes, num_reducers)?,
            };
            self.store.register_map_output(shuffle, &self.host, payloads)?;
        }

        let stats = self.store.map_output_statistics(shuffle)?;
        let handle = self.store.handle(shuffle)?;
        self.shuffles
            .write()
            .expect("shuffle registry lock poisoned")
            .insert(stage, shuffle);
        debug!(
            %stage,
            mappers = stats.num_mappers,
            reducers = stats.num_partitions(),
            bytes = stats.total_bytes(),
            "shuffle stage materialized"
        );
        Ok((ShuffledRowSet { handle }, stats))
    }

    fn broadcast(&self, stage: StageId, plan: &PlanNode) -> Result<BroadcastPayload> {
        let batches = self
            .materialize_partitions(plan)?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        let payload = BroadcastPayload::new(batches);
        self.broadcasts
            .write()
            .expect("broadcast registry lock poisoned")
            .insert(stage, payload.clone());
        debug!(%stage, bytes = payload.size_in_bytes, "broadcast value prepared");
        Ok(payload)
    }

    fn execute_plan(&self, plan: &PlanNode) -> Result<RowSet> {
        Ok(RowSet {
            partitions: self.materialize_partitions(plan)?,
        })
    }
}

fn single_payload(batches: &[RecordBatch]) -> Result<MapPartitionPayload> {
    let Some(first) = batches.first() else {
        return Ok(MapPartitionPayload {
            bytes: Vec::new(),
            rows: 0,
        });
    };
    Ok(MapPartitionPayload {
        bytes: encode_ipc_bytes(&first.schema(), batches)?,
        rows: batches.iter().map(|b| b.num_rows() as u64).sum(),
    })
}

fn operator_name(plan: &PlanNode) -> &'static str {
    match plan {
        PlanNode::Scan(_) => "Scan",
        PlanNode::Sort(_) => "Sort",
        PlanNode::SortMergeJoin(_) => "SortMergeJoin",
        PlanNode::BroadcastHashJoin(_) => "BroadcastHashJoin",
        PlanNode::Union(_) => "Union",
        PlanNode::Write(_) => "Write",
        PlanNode::Exchange(ExchangeExec::Shuffle(_)) => "ShuffleExchange",
        PlanNode::Exchange(ExchangeExec::Broadcast(_)) => "BroadcastExchange",
        PlanNode::ShuffleStageInput(_) => "ShuffleStageInput",
        PlanNode::SkewedShuffleStageInput(_) => "SkewedShuffleStageInput",
        PlanNode::BroadcastStageInput(_) => "BroadcastStageInput",
    }
}
