//! Typed error hierarchy for Conveyor.
//!
//! One enum per subsystem:
//! - `StateError`: workflow record persistence
//! - `ResourceError`: workspace and port pool leasing
//! - `ToolError`: external checker subprocesses
//! - `ValidationError`: decomposition plans rejected by the analyzer
//! - `TrackerError`: issue tracker collaborator
//! - `WorkflowError`: orchestrator failures that end a run

use std::path::PathBuf;

use thiserror::Error;

use crate::phase::WorkflowStatus;

/// Errors from the workflow state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Workflow {id} not found")]
    NotFound { id: String },

    #[error("Workflow record {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Invalid workflow id '{id}'")]
    InvalidId { id: String },

    #[error("Failed to access workflow record at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the resource allocator.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("All {capacity} resource slots are in use; retry after a workflow releases its lease")]
    Exhausted { capacity: usize },

    #[error("Failed to lock resource index at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Resource index at {path} is corrupt: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    #[error("Failed to provision workspace for {id}: {message}")]
    Workspace { id: String, message: String },

    #[error("Failed to remove workspace {path}: {message}")]
    Cleanup { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from an external checker subprocess.
///
/// All of these surface to the resolver as a tool error, retryable unless the
/// message names a permission or auth problem.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{kind} tool output malformed: {reason}")]
    OutputMalformed { kind: String, reason: String },

    #[error("{kind} tool timed out after {secs}s")]
    Timeout { kind: String, secs: u64 },

    #[error("{kind} tool crashed: {message}")]
    Crashed { kind: String, message: String },

    #[error("Failed to spawn {kind} tool: {source}")]
    Spawn {
        kind: String,
        #[source]
        source: std::io::Error,
    },
}

/// A decomposition plan that the analyzer refuses. Never auto-repaired.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("Decomposition must have between {min} and {max} sub-issues, got {count}")]
    SubIssueCount { count: usize, min: usize, max: usize },

    #[error("Atomic plan must not list sub-issues (found {count})")]
    AtomicWithSubIssues { count: usize },

    #[error("Sub-issue {index} is missing a {field}")]
    MissingField { index: usize, field: &'static str },

    #[error("Sub-issue {index} depends on out-of-range index {dependency}")]
    DependencyOutOfRange { index: usize, dependency: usize },

    #[error("Sub-issue {index} depends on itself")]
    SelfDependency { index: usize },

    #[error("Dependency cycle among sub-issues {members:?}")]
    Cycle { members: Vec<usize> },
}

/// Errors from the issue tracker collaborator.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Issue {reference} not found")]
    IssueNotFound { reference: String },

    #[error("Invalid issue reference '{0}'")]
    InvalidReference(String),

    #[error("Rate limited by issue tracker (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("Issue tracker rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Issue tracker request failed: {0}")]
    Request(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that end a workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Workflow {id} aborted")]
    Aborted { id: String },

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
