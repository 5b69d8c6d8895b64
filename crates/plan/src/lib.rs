//! Physical plan model and plan-level rules for adaptive stage execution.
//!
//! Architecture role:
//! - the [`PlanNode`] sum type every rewrite pattern-matches over
//! - attribute identity and the renaming maps stage inputs apply
//! - [`QueryStage`] wrappers with single-assignment statistics/result slots
//! - semantic plan equality used for stage reuse
//! - the exchange/sort insertion rule and plan rendering
//!
//! Key modules:
//! - [`attr`]
//! - [`expr`]
//! - [`node`]
//! - [`partitioning`]
//! - [`stage`]
//! - [`equality`]
//! - [`ensure`]
//! - [`explain`]

pub mod attr;
pub mod ensure;
pub mod equality;
pub mod explain;
pub mod expr;
pub mod node;
pub mod partitioning;
pub mod stage;

pub use attr::{schema_of, Attribute, AttributeMap};
pub use ensure::{count_shuffle_exchanges, ensure_requirements};
pub use equality::same_result;
pub use explain::explain_plan;
pub use expr::{BinaryOp, Expr, LiteralValue};
pub use node::*;
pub use partitioning::{ordering_satisfied, Distribution, Partitioning, SortOrder};
pub use stage::{QueryStage, StageArtifact, StageKind};
