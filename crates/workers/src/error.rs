//! Worker-level error types.

use thiserror::Error;

/// Errors returned by a worker's `execute` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`: the attempt counts against the step's `max_retries`.
/// - `Fatal`: the step is failed immediately, remaining retries are skipped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Transient failure; the engine should re-try the step.
    #[error("retryable worker error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal worker error: {0}")]
    Fatal(String),
}

impl WorkerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// A capability tag failed validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability tag must not be empty")]
    Empty,

    #[error("invalid capability tag '{0}': only lowercase letters, digits, '.', '_' and '-' are allowed")]
    InvalidCharacters(String),
}
