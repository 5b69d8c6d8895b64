#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for
//! stageflow crates.
//!
//! Architecture role:
//! - defines the adaptive-execution configuration passed across layers
//! - provides the common [`SfError`] / [`Result`] contracts
//! - hosts the metrics registry used by the stage runtime
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Adaptive-execution configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::AdaptiveConfig;
pub use error::{Result, SfError};
pub use ids::*;
pub use metrics::MetricsRegistry;
