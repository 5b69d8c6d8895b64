use thiserror::Error;

/// Canonical stageflow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SfError::PlanInvariant`]: structural plan/stage contract violations; fatal to the query
/// - [`SfError::Coordinator`]: exchange-coordinator precondition failures; fatal to the query
/// - [`SfError::Execution`]: runtime stage/shuffle evaluation or decode failures
/// - [`SfError::InvalidConfig`]: configuration/registration contract violations
/// - [`SfError::Unsupported`]: syntactically valid but intentionally unimplemented behavior
/// - [`SfError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum SfError {
    /// Invalid or inconsistent configuration state.
    ///
    /// Examples:
    /// - registering a table with zero partitions
    /// - an exchange declaring a zero partition count
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A structural invariant of the stage/plan model was violated.
    ///
    /// Examples:
    /// - a shuffle stage whose child is not a shuffle exchange
    /// - `execute` called on a broadcast stage
    /// - map-output statistics assigned twice to the same stage
    #[error("plan invariant violated: {0}")]
    PlanInvariant(String),

    /// Exchange-coordinator precondition failure.
    ///
    /// Examples:
    /// - map-output statistics disagreeing on the pre-shuffle partition count
    #[error("coordinator precondition failed: {0}")]
    Coordinator(String),

    /// Runtime execution failures after planning succeeded.
    ///
    /// Examples:
    /// - shuffle payload decode failures
    /// - a child stage failing while the parent awaits its statistics
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature/shape not implemented in this environment.
    ///
    /// Examples:
    /// - materializing an operator owned by the external operator library
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard stageflow result alias.
pub type Result<T> = std::result::Result<T, SfError>;
