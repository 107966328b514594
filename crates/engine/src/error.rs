//! Engine-level error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;
use workers::{CapabilityError, WorkerError};

/// A workflow definition was rejected at construction time.
///
/// Never surfaces mid-run: a graph that builds is executable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// A step depends on a step ID that doesn't exist in the workflow.
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    /// The dependency graph is not acyclic. `path` starts and ends with the
    /// same step.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// A step requires a capability the engine's catalog doesn't know.
    #[error("step '{step_id}' requires unknown capability '{capability}'")]
    UnknownCapability { step_id: String, capability: String },

    #[error(transparent)]
    InvalidCapability(#[from] CapabilityError),

    /// A step field is out of range.
    #[error("step '{step_id}' is invalid: {reason}")]
    InvalidStep { step_id: String, reason: String },

    /// A workflow-level field is out of range.
    #[error("workflow is invalid: {0}")]
    InvalidWorkflow(String),
}

impl ValidationError {
    /// Step IDs named by this error, if any.
    pub fn step_ids(&self) -> Vec<&str> {
        match self {
            Self::DuplicateStepId(id) => vec![id.as_str()],
            Self::UnknownDependency { step_id, dependency } => {
                vec![step_id.as_str(), dependency.as_str()]
            }
            Self::Cycle { path } => path.iter().map(String::as_str).collect(),
            Self::UnknownCapability { step_id, .. } | Self::InvalidStep { step_id, .. } => {
                vec![step_id.as_str()]
            }
            Self::InvalidCapability(_) | Self::InvalidWorkflow(_) => Vec::new(),
        }
    }
}

/// Why a single step attempt (or the step as a whole) did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    /// The attempt ran longer than the step's timeout. Consumes a retry.
    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// The worker panicked; treated like a returned error.
    #[error("worker panicked: {0}")]
    Panicked(String),

    /// Every allowed attempt failed.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<StepError> },

    /// The workflow was cancelled while the step was in flight.
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether another attempt may follow this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Panicked(_) => true,
            Self::Worker(e) => e.is_retryable(),
            Self::RetriesExhausted { .. } | Self::Cancelled => false,
        }
    }
}

/// Errors produced by the engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No workflow with this ID is known to the supervisor.
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    /// A workflow with this ID already exists (resume of a live workflow).
    #[error("workflow {0} already exists")]
    DuplicateWorkflow(Uuid),

    /// `execute_workflow` was called twice for the same workflow.
    #[error("workflow {0} has already been executed")]
    AlreadyExecuted(Uuid),

    /// The workflow was cancelled before it could execute.
    #[error("workflow {0} was cancelled")]
    WorkflowCancelled(Uuid),

    /// The admission backlog is full; retry later.
    #[error("engine overloaded: {backlog} workflows awaiting admission (limit {limit})")]
    EngineOverload { backlog: usize, limit: usize },

    /// A worker registration was rejected.
    #[error("worker '{worker_id}' rejected: {reason}")]
    WorkerRegistration { worker_id: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
