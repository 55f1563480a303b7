//! Error taxonomy for `driftctl`.
//!
//! Split into a leaf error per subsystem (`PathError`, `LensError`,
//! `PlanError`, `RuntimeError`), composed by `#[from]` into the crate-level
//! [`DriftError`] exposed at the facade boundary.

use std::time::Duration;

use thiserror::Error;

use crate::diff::Op;

/// Result alias used throughout the crate's lower layers.
pub type DriftResult<T> = Result<T, DriftError>;

/// Errors raised while parsing or applying a path against a state value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path must start with '/': {0:?}")]
    MissingLeadingSlash(String),

    #[error("segment {0:?} cannot index into a non-object/non-array value")]
    InvalidSegment(String),

    #[error("array index {0:?} is not a valid non-negative integer")]
    InvalidIndex(String),
}

/// Errors raised while matching a lens template against a concrete path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LensError {
    #[error("template has {template} segments but path has {actual}")]
    SegmentCountMismatch { template: usize, actual: usize },

    #[error("literal segment {expected:?} does not match path segment {actual:?}")]
    LiteralMismatch { expected: String, actual: String },

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Reasons the planner gave up on a particular search branch or the whole
/// search.
#[derive(Debug, Error, Clone)]
pub enum PlanError {
    #[error("search exhausted at depth {0}")]
    SearchFailed(usize),

    #[error("loop detected: instruction {0} already present on this path")]
    LoopDetected(String),

    #[error("recursion detected: method {0} already on the call stack")]
    RecursionDetected(String),

    #[error("condition not met for instruction {0}")]
    ConditionNotMet(String),

    #[error("method {0} produced no branches")]
    MethodExpansionEmpty(String),

    #[error("failed to merge parallel branch results")]
    MergeFailed,

    #[error("conflicting parallel operations on overlapping paths: {0:?} vs {1:?}")]
    ConflictDetected(Op, Op),

    #[error(transparent)]
    Lens(#[from] LensError),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Errors surfaced while walking and executing a plan DAG.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime has not been started")]
    NotStarted,

    #[error("runtime was stopped before reaching the target")]
    Stopped,

    #[error("planning/execution failed after {0} attempt(s)")]
    Failure(u32),

    #[error("timed out after {0:?} waiting for completion")]
    Timeout(Duration),

    #[error("action condition no longer holds for {0}")]
    ActionConditionFailed(String),

    #[error("action {action} failed: {cause}")]
    ActionRunFailed { action: String, cause: String },

    #[error("execution was cancelled")]
    Cancelled,

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("unexpected error: {0}")]
    UnknownError(String),
}

/// Top-level error exposed across the crate's public facade.
#[derive(Debug, Error)]
pub enum DriftError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Lens(#[from] LensError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[cfg(feature = "config")]
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
