//! Stage runtime: concurrent child-stage preparation, the statistics
//! barrier, adaptive rewrites, and memoized stage execution.
//!
//! Concurrency contract:
//! - each stage's artifact mutex is its monitor; concurrent `execute` calls
//!   on one stage serialize and only the first does the work;
//! - child stages are prepared on spawned tasks and joined before the
//!   parent's rewriters run, so their statistics are fully visible;
//! - failures propagate before anything is cached, and the next call
//!   retries the whole protocol.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use stageflow_common::metrics::global_metrics;
use stageflow_common::{AdaptiveConfig, Result, SfError};
use stageflow_plan::{
    ensure_requirements, explain_plan, ExchangeExec, PlanNode, QueryStage, StageArtifact,
    StageKind,
};
use stageflow_shuffle::{BroadcastPayload, MapOutputStatistics};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::{partition_bytes_histogram, ExchangeCoordinator};
use crate::env::ExecutionEnv;
use crate::events::{AdaptiveExecutionUpdate, EventBus, TracingEventBus};
use crate::rewrite::{handle_skewed_join, optimize_join};

// Partition count for exchanges inserted while evaluating rewrite candidates.
const DEFAULT_SHUFFLE_PARTITIONS: usize = 64;

/// Executes the DAG of query stages against an execution environment.
///
/// Cheap to clone; all clones share the same environment and event bus.
#[derive(Clone)]
pub struct StageRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    env: Arc<dyn ExecutionEnv>,
    events: Arc<dyn EventBus>,
    config: AdaptiveConfig,
    shuffle_partitions: usize,
}

impl StageRuntime {
    /// Runtime with the default tracing event bus.
    pub fn new(env: Arc<dyn ExecutionEnv>, config: AdaptiveConfig) -> Self {
        Self::with_events(env, config, Arc::new(TracingEventBus))
    }

    /// Runtime posting adaptive-execution updates to `events`.
    pub fn with_events(
        env: Arc<dyn ExecutionEnv>,
        config: AdaptiveConfig,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                env,
                events,
                config,
                shuffle_partitions: DEFAULT_SHUFFLE_PARTITIONS,
            }),
        }
    }

    /// The environment this runtime executes against.
    pub fn env(&self) -> Arc<dyn ExecutionEnv> {
        self.inner.env.clone()
    }

    /// Execute a shuffle or result stage, memoized on first call.
    pub fn execute<'a>(
        &'a self,
        stage: &'a Arc<QueryStage>,
    ) -> BoxFuture<'a, Result<StageArtifact>> {
        Box::pin(async move {
            if stage.kind() == StageKind::Broadcast {
                return Err(SfError::PlanInvariant(format!(
                    "broadcast stage {} cannot be executed as a row stage",
                    stage.id()
                )));
            }
            let mut slot = stage.lock_artifact().await;
            if let Some(artifact) = slot.as_ref() {
                return Ok(artifact.clone());
            }
            let started = Instant::now();

            // 1. Ready every child stage and block on their statistics.
            let child = stage.child_plan();
            self.prepare_child_stages(&child).await?;
            self.log_input_histograms(stage, &child);

            // 2. Statistics-driven rewrites, then re-established requirements.
            let (plan, join_changed) = optimize_join(
                child,
                stage.kind(),
                &self.inner.config,
                self.inner.shuffle_partitions,
            );
            let (plan, skew_changed) = handle_skewed_join(plan, &self.inner.config);
            let plan = if join_changed || skew_changed {
                ensure_requirements(plan, self.inner.shuffle_partitions)
            } else {
                plan
            };

            // 3. Reducer-count determination from measured sizes.
            let plan = self.assign_partition_ranges(stage, plan)?;

            // 4/5. Fusion hook, commit, observability.
            let plan = self.inner.env.collapse_codegen(plan);
            stage.set_child(plan.clone());
            self.inner.events.post(AdaptiveExecutionUpdate {
                stage: stage.id(),
                plan_string: explain_plan(&plan),
            });

            // 6. Execute the finalized child.
            let artifact = match stage.kind() {
                StageKind::Shuffle => {
                    let PlanNode::Exchange(ExchangeExec::Shuffle(exchange)) = plan else {
                        return Err(SfError::PlanInvariant(format!(
                            "shuffle stage {} child must be a shuffle exchange",
                            stage.id()
                        )));
                    };
                    let (rows, stats) =
                        self.inner.env.eager_execute_shuffle(stage.id(), &exchange)?;
                    global_metrics().add_shuffle_bytes_written(stage.id().0, stats.total_bytes());
                    stage.set_statistics(stats)?;
                    StageArtifact::Shuffled(rows)
                }
                StageKind::Result => StageArtifact::Rows(self.inner.env.execute_plan(&plan)?),
                StageKind::Broadcast => unreachable!("rejected above"),
            };

            global_metrics()
                .record_stage_execution(stage.kind().label(), started.elapsed().as_secs_f64());
            info!(stage = %stage.id(), kind = stage.kind().label(), "stage executed");
            *slot = Some(artifact.clone());
            Ok(artifact)
        })
    }

    /// Ready a broadcast stage, idempotently.
    pub fn prepare_broadcast<'a>(
        &'a self,
        stage: &'a Arc<QueryStage>,
    ) -> BoxFuture<'a, Result<BroadcastPayload>> {
        Box::pin(async move {
            if stage.kind() != StageKind::Broadcast {
                return Err(SfError::PlanInvariant(format!(
                    "stage {} is not a broadcast stage",
                    stage.id()
                )));
            }
            let mut slot = stage.lock_artifact().await;
            if let Some(StageArtifact::Broadcast(payload)) = slot.as_ref() {
                return Ok(payload.clone());
            }
            let started = Instant::now();

            let child = stage.child_plan();
            self.prepare_child_stages(&child).await?;
            let plan = self.inner.env.collapse_codegen(child);
            stage.set_child(plan.clone());

            let PlanNode::Exchange(ExchangeExec::Broadcast(exchange)) = plan else {
                return Err(SfError::PlanInvariant(format!(
                    "broadcast stage {} child must be a broadcast exchange",
                    stage.id()
                )));
            };
            let payload = self.inner.env.broadcast(stage.id(), &exchange.input)?;

            global_metrics()
                .record_stage_execution(stage.kind().label(), started.elapsed().as_secs_f64());
            info!(stage = %stage.id(), "broadcast stage prepared");
            *slot = Some(StageArtifact::Broadcast(payload.clone()));
            Ok(payload)
        })
    }

    /// The broadcast value of a prepared (or to-be-prepared) stage.
    pub async fn broadcast_value(&self, stage: &Arc<QueryStage>) -> Result<BroadcastPayload> {
        self.prepare_broadcast(stage).await
    }

    // Submit every referenced child stage once and join all of them.
    async fn prepare_child_stages(&self, plan: &PlanNode) -> Result<()> {
        let mut seen = BTreeSet::new();
        let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();

        for input in plan.shuffle_stage_inputs() {
            if seen.insert(input.stage.id()) {
                let runtime = self.clone();
                let child = input.stage.clone();
                handles.push(tokio::spawn(async move {
                    runtime.execute(&child).await.map(|_| ())
                }));
            }
        }
        for input in plan.broadcast_stage_inputs() {
            if seen.insert(input.stage.id()) {
                let runtime = self.clone();
                let child = input.stage.clone();
                handles.push(tokio::spawn(async move {
                    runtime.prepare_broadcast(&child).await.map(|_| ())
                }));
            }
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| SfError::Execution(format!("child stage task failed: {e}")))??;
        }
        Ok(())
    }

    // Assign coalesced partition ranges to every pending shuffle input.
    fn assign_partition_ranges(&self, stage: &QueryStage, plan: PlanNode) -> Result<PlanNode> {
        let assignment = {
            let pending = plan
                .shuffle_stage_inputs()
                .into_iter()
                .filter(|i| !i.is_local_shuffle && i.partition_start_indices.is_none())
                .collect::<Vec<_>>();
            if pending.is_empty() {
                None
            } else {
                let stats = pending
                    .iter()
                    .map(|i| {
                        i.stage.statistics().cloned().ok_or_else(|| {
                            SfError::PlanInvariant(format!(
                                "stage {} has no statistics after child preparation",
                                i.stage.id()
                            ))
                        })
                    })
                    .collect::<Result<Vec<MapOutputStatistics>>>()?;
                let stats_refs = stats.iter().collect::<Vec<_>>();
                let coordinator = ExchangeCoordinator::from_config(&self.inner.config);

                let skew_sets = pending
                    .iter()
                    .map(|i| i.skewed_partitions.clone())
                    .collect::<Vec<_>>();
                if pending.len() == 2 && skew_sets.iter().all(Option::is_some) {
                    // Both join sides agree on the handled set; the union is
                    // the set the sub-joins took over.
                    let mut skewed = skew_sets[0].clone().expect("checked above");
                    skewed.extend(skew_sets[1].clone().expect("checked above"));
                    let (starts, ends) = coordinator
                        .estimate_partition_start_end_indices(&stats_refs, &skewed)?;
                    Some((starts, Some(ends)))
                } else {
                    let starts = coordinator.estimate_partition_start_indices(&stats_refs)?;
                    Some((starts, None))
                }
            }
        };

        let Some((starts, ends)) = assignment else {
            return Ok(plan);
        };
        global_metrics().set_post_shuffle_partitions(stage.id().0, starts.len() as u64);
        debug!(
            stage = %stage.id(),
            groups = starts.len(),
            "assigned post-shuffle partition ranges"
        );
        Ok(assign_ranges(plan, &starts, &ends))
    }

    fn log_input_histograms(&self, stage: &QueryStage, plan: &PlanNode) {
        for input in plan.shuffle_stage_inputs() {
            if let Some(stats) = input.stage.statistics() {
                debug!(
                    stage = %stage.id(),
                    input_stage = %input.stage.id(),
                    histogram = ?partition_bytes_histogram(stats),
                    "observed map-output distribution"
                );
            }
        }
    }
}

fn assign_ranges(plan: PlanNode, starts: &[u32], ends: &Option<Vec<u32>>) -> PlanNode {
    let plan = plan.map_children(&mut |c| assign_ranges(c, starts, ends));
    match plan {
        PlanNode::ShuffleStageInput(mut input)
            if !input.is_local_shuffle && input.partition_start_indices.is_none() =>
        {
            input.partition_start_indices = Some(starts.to_vec());
            input.partition_end_indices = ends.clone();
            PlanNode::ShuffleStageInput(input)
        }
        other => other,
    }
}
