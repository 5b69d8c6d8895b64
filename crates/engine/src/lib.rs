//! Adaptive query-stage engine.
//!
//! Architecture role:
//! - fragments physical plans at exchange boundaries ([`planner`])
//! - executes the stage DAG with a statistics barrier between child and
//!   parent stages ([`runtime`])
//! - turns measured map-output sizes into post-shuffle partition ranges
//!   ([`coordinator`])
//! - rewrites join strategy and skewed joins between the barrier and
//!   execution ([`rewrite`])
//!
//! The engine is an in-process library: it consumes the host's execution
//! environment ([`env::ExecutionEnv`]) and posts plan updates on an event
//! bus ([`events::EventBus`]).

pub mod coordinator;
pub mod env;
pub mod events;
pub mod planner;
pub mod rewrite;
pub mod runtime;

pub use coordinator::{partition_bytes_histogram, ExchangeCoordinator, PartitionBytesBucket};
pub use env::{ExecutionEnv, LocalExecutionEnv};
pub use events::{AdaptiveExecutionUpdate, EventBus, RecordingEventBus, TracingEventBus};
pub use planner::{PlannedQuery, QueryStagePlanner};
pub use rewrite::{handle_skewed_join, optimize_join};
pub use runtime::StageRuntime;
