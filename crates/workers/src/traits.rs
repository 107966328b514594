//! The `Worker` trait: the capability-execution contract every worker must fulfil.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Capability, WorkerError};

/// JSON object used for workflow context and step input.
pub type JsonMap = serde_json::Map<String, Value>;

/// The core worker trait.
///
/// Workers are free to call out to any external system internally; the engine
/// treats `execute` as an opaque, possibly slow, possibly failing call and
/// applies its own timeout and retry policy around it.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Run `task_name` with the workflow's read-only `context` and the
    /// step-specific `input`, returning the step's JSON result.
    async fn execute(
        &self,
        task_name: &str,
        context: &JsonMap,
        input: JsonMap,
    ) -> Result<Value, WorkerError>;

    /// Capability tags this worker can serve.
    fn declared_capabilities(&self) -> BTreeSet<Capability>;
}
